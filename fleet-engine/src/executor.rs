// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-instance state machine
//!
//! One executor runs per discovered instance: normalise (start a stopped
//! instance), preflight (upgradability check or rollback eligibility),
//! execute the provider operation, track it to completion, verify health,
//! and optionally compensate a failed upgrade with an automatic rollback.
//! Failures never unwind past this module; every path folds into exactly
//! one [`OperationResult`].

use crate::clock::is_cancelled;
use crate::clock::CancelSignal;
use crate::clock::Clock;
use crate::eligibility;
use crate::health::verify_health;
use crate::service::InstanceService;
use crate::tracker::call_with_backoff;
use crate::tracker::track_operation;
use crate::tracker::Deadline;
use fleet_common::config::OperationKind;
use fleet_common::config::RunConfig;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use fleet_common::report::OperationResult;
use fleet_common::report::OperationStatus;
use fleet_common::Error;
use fleet_common::ErrorKind;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Drives one instance through its lifecycle transition.
pub(crate) struct InstanceExecutor {
    svc: Arc<dyn InstanceService>,
    clock: Arc<dyn Clock>,
    cfg: RunConfig,
    log: Logger,
    cancel: CancelSignal,
}

/// Outcome of the normalisation phase.
enum Normalised {
    /// The instance is (or, for a dry run, is assumed to become) ready.
    Ready {
        /// Dry run only: the instance would first have been started, so
        /// the eligibility evaluator must see the state check as skipped.
        start_pending: bool,
        /// Set when normalisation actually started the instance and the
        /// discovery snapshot's metadata is stale.
        refreshed: Option<InstanceSnapshot>,
    },
    /// The instance cannot be acted on in this run.
    Done(OperationResult),
}

impl InstanceExecutor {
    pub fn new(
        svc: Arc<dyn InstanceService>,
        clock: Arc<dyn Clock>,
        cfg: RunConfig,
        log: &Logger,
        cancel: CancelSignal,
    ) -> InstanceExecutor {
        InstanceExecutor { svc, clock, cfg, log: log.clone(), cancel }
    }

    /// Run the full state machine for one instance.
    pub async fn execute(
        mut self,
        snapshot: InstanceSnapshot,
    ) -> OperationResult {
        self.log = self.log.new(o!(
            "instance" => snapshot.short_name.clone(),
            "location" => snapshot.location.clone(),
        ));
        let started_at = self.clock.now();
        let mut result = self.drive(&snapshot).await;
        result.started_at = Some(started_at);
        result.finished_at = Some(self.clock.now());
        info!(
            self.log,
            "instance finished";
            "phase" => "done",
            "status" => %result.status,
        );
        result
    }

    async fn drive(&mut self, snapshot: &InstanceSnapshot) -> OperationResult {
        if is_cancelled(&self.cancel) {
            return self.cancelled_result(snapshot, "cancelled before start");
        }

        let (start_pending, current) = match self.normalise(snapshot).await {
            Normalised::Ready { start_pending, refreshed } => {
                (start_pending, refreshed.unwrap_or_else(|| snapshot.clone()))
            }
            Normalised::Done(result) => return result,
        };

        match self.cfg.operation {
            OperationKind::Upgrade => self.run_upgrade(&current).await,
            OperationKind::Rollback => {
                self.run_rollback(&current, start_pending).await
            }
        }
    }

    /// Bring the instance into `ACTIVE` state, or classify it as
    /// unactionable.
    ///
    /// Never mutates anything in a dry run: a stopped instance is assumed
    /// started and the assumption is surfaced to the caller instead.
    async fn normalise(&mut self, snapshot: &InstanceSnapshot) -> Normalised {
        match snapshot.state {
            InstanceState::Active => {
                Normalised::Ready { start_pending: false, refreshed: None }
            }
            state if state.is_startable() => {
                if self.cfg.dry_run {
                    info!(
                        self.log,
                        "would start instance before operation";
                        "phase" => "normalise",
                        "state" => %state,
                    );
                    return Normalised::Ready {
                        start_pending: true,
                        refreshed: None,
                    };
                }
                match self.start_and_wait(snapshot).await {
                    Ok(refreshed) => Normalised::Ready {
                        start_pending: false,
                        refreshed: Some(refreshed),
                    },
                    Err(error) => Normalised::Done(
                        self.error_result(snapshot, error, "normalise"),
                    ),
                }
            }
            state => {
                // Transient states are not waited out: this is a one-shot
                // tool, and waiting risks blowing the maintenance window.
                warn!(
                    self.log,
                    "instance is busy; skipping";
                    "phase" => "normalise",
                    "state" => %state,
                );
                let mut result = self.result(snapshot, OperationStatus::Skipped);
                result.error_kind = Some(ErrorKind::Busy);
                result.error_message =
                    Some(format!("instance busy (state={state})"));
                Normalised::Done(result)
            }
        }
    }

    /// Start a stopped instance, wait for the start operation, and confirm
    /// the instance comes up `ACTIVE`.  The whole phase is charged to the
    /// health-check budget.
    async fn start_and_wait(
        &mut self,
        snapshot: &InstanceSnapshot,
    ) -> Result<InstanceSnapshot, Error> {
        let deadline = Deadline::after(self.cfg.health_check_timeout());
        info!(
            self.log,
            "starting instance before operation";
            "phase" => "normalise",
            "state" => %snapshot.state,
        );
        let handle = {
            let svc = &self.svc;
            let name = snapshot.name.clone();
            call_with_backoff(
                &*self.clock,
                &self.log,
                self.cfg.poll_interval(),
                &deadline,
                &mut self.cancel,
                || svc.start_instance(&name),
            )
            .await?
        };
        track_operation(
            &*self.svc,
            &*self.clock,
            &self.log,
            &handle,
            self.cfg.poll_interval(),
            &deadline,
            &mut self.cancel,
        )
        .await?;
        verify_health(
            &*self.svc,
            &*self.clock,
            &self.log,
            &snapshot.name,
            self.cfg.poll_interval(),
            &deadline,
            &mut self.cancel,
        )
        .await?;
        self.svc.get_instance(&snapshot.name).await
    }

    async fn run_upgrade(
        &mut self,
        snapshot: &InstanceSnapshot,
    ) -> OperationResult {
        let check = match self.svc.check_upgradable(&snapshot.name).await {
            Ok(check) => check,
            Err(error) => {
                return self.error_result(snapshot, error, "preflight")
            }
        };
        if !check.upgradable {
            info!(
                self.log,
                "instance is up to date";
                "phase" => "preflight",
                "current_version" => %snapshot.current_version,
            );
            return self.result(snapshot, OperationStatus::UpToDate);
        }

        if self.cfg.dry_run {
            info!(
                self.log,
                "would upgrade instance";
                "phase" => "preflight",
                "target_version" => ?check.target_version,
            );
            let mut result = self.result(snapshot, OperationStatus::DryRun);
            result.target_version = check.target_version;
            return result;
        }

        let deadline = Deadline::after(self.cfg.operation_timeout());
        let handle = {
            let svc = &self.svc;
            let name = snapshot.name.clone();
            let begun = call_with_backoff(
                &*self.clock,
                &self.log,
                self.cfg.poll_interval(),
                &deadline,
                &mut self.cancel,
                || svc.begin_upgrade(&name),
            )
            .await;
            match begun {
                Ok(handle) => handle,
                Err(error) => {
                    return self.error_result(snapshot, error, "execute")
                }
            }
        };
        info!(
            self.log,
            "upgrade started";
            "phase" => "execute",
            "operation" => %handle,
            "target_version" => ?check.target_version,
        );

        let mut result =
            self.finish_operation(snapshot, &handle, &deadline).await;
        result.target_version = check.target_version;

        if result.status == OperationStatus::Failed
            && self.cfg.rollback_on_failure
            && result.error_kind != Some(ErrorKind::Cancelled)
        {
            self.compensate(snapshot, &mut result).await;
        }
        result
    }

    async fn run_rollback(
        &mut self,
        snapshot: &InstanceSnapshot,
        start_pending: bool,
    ) -> OperationResult {
        let eligibility = eligibility::evaluate(
            snapshot,
            self.clock.now(),
            start_pending,
        );
        for check in &eligibility.checks {
            info!(
                self.log,
                "rollback pre-check";
                "phase" => "preflight",
                "check" => %check.name,
                "verdict" => ?check.verdict,
                "message" => %check.message,
            );
        }

        if !eligibility.eligible {
            let mut result = self.result(snapshot, OperationStatus::Skipped);
            result.error_kind = Some(ErrorKind::Ineligible);
            result.error_message = Some(format!(
                "not eligible for rollback: {}",
                eligibility.failure_summary()
            ));
            result.pre_checks = eligibility.checks;
            return result;
        }

        if self.cfg.dry_run {
            info!(
                self.log,
                "would roll back instance";
                "phase" => "preflight",
                "target_version" => ?snapshot.previous_version,
            );
            let mut result = self.result(snapshot, OperationStatus::DryRun);
            result.target_version = snapshot.previous_version.clone();
            result.pre_checks = eligibility.checks;
            return result;
        }

        let deadline = Deadline::after(self.cfg.operation_timeout());
        let handle = {
            let svc = &self.svc;
            let name = snapshot.name.clone();
            let begun = call_with_backoff(
                &*self.clock,
                &self.log,
                self.cfg.poll_interval(),
                &deadline,
                &mut self.cancel,
                || svc.begin_rollback(&name),
            )
            .await;
            match begun {
                Ok(handle) => handle,
                Err(error) => {
                    let mut result =
                        self.error_result(snapshot, error, "execute");
                    result.pre_checks = eligibility.checks;
                    return result;
                }
            }
        };
        info!(
            self.log,
            "rollback started";
            "phase" => "execute",
            "operation" => %handle,
            "target_version" => ?snapshot.previous_version,
        );

        let mut result =
            self.finish_operation(snapshot, &handle, &deadline).await;
        result.target_version = snapshot.previous_version.clone();
        result.pre_checks = eligibility.checks;
        result
    }

    /// Track a begun operation to completion and verify instance health,
    /// folding the outcome into a result.
    async fn finish_operation(
        &mut self,
        snapshot: &InstanceSnapshot,
        handle: &fleet_common::instance::OperationHandle,
        deadline: &Deadline,
    ) -> OperationResult {
        let tracked = track_operation(
            &*self.svc,
            &*self.clock,
            &self.log,
            handle,
            self.cfg.poll_interval(),
            deadline,
            &mut self.cancel,
        )
        .await;
        if let Err(error) = tracked {
            if error == Error::Cancelled {
                let mut result = self.cancelled_result(
                    snapshot,
                    &format!(
                        "cancelled while tracking {handle}; server-side \
                         outcome UNKNOWN"
                    ),
                );
                result.duration_seconds =
                    Some(deadline.elapsed().as_secs_f64());
                return result;
            }
            let mut result = self.error_result(snapshot, error, "track");
            result.duration_seconds = Some(deadline.elapsed().as_secs_f64());
            return result;
        }

        let verify_budget =
            Duration::min(self.cfg.health_check_timeout(), deadline.remaining());
        let verify_deadline = Deadline::after(verify_budget);
        let verified = verify_health(
            &*self.svc,
            &*self.clock,
            &self.log,
            &snapshot.name,
            self.cfg.poll_interval(),
            &verify_deadline,
            &mut self.cancel,
        )
        .await;
        let mut result = match verified {
            Ok(()) => self.result(snapshot, OperationStatus::Succeeded),
            Err(Error::Cancelled) => self.cancelled_result(
                snapshot,
                "cancelled during health verification",
            ),
            Err(error) => self.error_result(snapshot, error, "verify"),
        };
        result.duration_seconds = Some(deadline.elapsed().as_secs_f64());
        result
    }

    /// Attempt the compensating rollback of a failed upgrade, mutating the
    /// failed result in place.
    async fn compensate(
        &mut self,
        snapshot: &InstanceSnapshot,
        result: &mut OperationResult,
    ) {
        warn!(
            self.log,
            "upgrade failed; attempting compensating rollback";
            "phase" => "compensate",
            "error" => ?result.error_message,
        );
        let compensation_started = Instant::now();
        match self.try_compensate(snapshot).await {
            Ok(()) => {
                info!(
                    self.log,
                    "compensating rollback complete";
                    "phase" => "compensate",
                );
                result.status = OperationStatus::Compensated;
                result.compensated = true;
            }
            Err(error) => {
                warn!(
                    self.log,
                    "compensating rollback failed";
                    "phase" => "compensate",
                    "error" => %error,
                );
                let message = result
                    .error_message
                    .take()
                    .unwrap_or_else(|| "upgrade failed".to_string());
                result.error_message = Some(format!(
                    "{message}; compensation_error: {error}"
                ));
            }
        }
        if let Some(duration) = result.duration_seconds.as_mut() {
            *duration += (Instant::now() - compensation_started).as_secs_f64();
        }
    }

    async fn try_compensate(
        &mut self,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), Error> {
        let fresh = self.svc.get_instance(&snapshot.name).await?;
        let eligibility =
            eligibility::evaluate(&fresh, self.clock.now(), false);
        if !eligibility.eligible {
            return Err(Error::precondition_violated(format!(
                "not eligible for rollback: {}",
                eligibility.failure_summary()
            )));
        }

        // The upgrade may already have consumed the whole operation
        // budget (e.g. on timeout), so compensation gets a fresh one.
        let deadline = Deadline::after(self.cfg.operation_timeout());
        let handle = {
            let svc = &self.svc;
            let name = snapshot.name.clone();
            call_with_backoff(
                &*self.clock,
                &self.log,
                self.cfg.poll_interval(),
                &deadline,
                &mut self.cancel,
                || svc.begin_rollback(&name),
            )
            .await?
        };
        track_operation(
            &*self.svc,
            &*self.clock,
            &self.log,
            &handle,
            self.cfg.poll_interval(),
            &deadline,
            &mut self.cancel,
        )
        .await?;
        let verify_budget = Duration::min(
            self.cfg.health_check_timeout(),
            deadline.remaining(),
        );
        let verify_deadline = Deadline::after(verify_budget);
        verify_health(
            &*self.svc,
            &*self.clock,
            &self.log,
            &snapshot.name,
            self.cfg.poll_interval(),
            &verify_deadline,
            &mut self.cancel,
        )
        .await
    }

    fn result(
        &self,
        snapshot: &InstanceSnapshot,
        status: OperationStatus,
    ) -> OperationResult {
        OperationResult::new(
            &snapshot.short_name,
            &snapshot.location,
            self.cfg.operation,
            status,
        )
    }

    /// Fold an error into a terminal result, classifying precondition
    /// refusals as "skipped because busy" (another controller most likely
    /// raced us).
    fn error_result(
        &self,
        snapshot: &InstanceSnapshot,
        error: Error,
        phase: &str,
    ) -> OperationResult {
        warn!(
            self.log,
            "instance operation failed";
            "phase" => phase,
            "error" => %error,
        );
        let mut result = match error.kind() {
            ErrorKind::PreconditionViolated => {
                let mut result =
                    self.result(snapshot, OperationStatus::Skipped);
                result.error_kind = Some(ErrorKind::Busy);
                result
            }
            kind => {
                let mut result = self.result(snapshot, OperationStatus::Failed);
                result.error_kind = Some(kind);
                result
            }
        };
        result.error_message = Some(error.to_string());
        result
    }

    fn cancelled_result(
        &self,
        snapshot: &InstanceSnapshot,
        message: &str,
    ) -> OperationResult {
        let mut result = self.result(snapshot, OperationStatus::Failed);
        result.error_kind = Some(ErrorKind::Cancelled);
        result.error_message = Some(message.to_string());
        result
    }
}
