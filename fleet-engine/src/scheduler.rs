// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet discovery and bounded-parallel dispatch
//!
//! One worker runs per discovered instance, at most `max_parallel` at any
//! moment, with a minimum stagger between successive dispatches.  Workers
//! communicate with the scheduler only by completing; results are sorted
//! and folded into the [`FleetReport`] once, at the end.

use crate::clock::cancelled;
use crate::clock::is_cancelled;
use crate::clock::sleep_unless_cancelled;
use crate::clock::CancelSignal;
use crate::clock::Clock;
use crate::executor::InstanceExecutor;
use crate::service::InstanceService;
use fleet_common::config::RunConfig;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use fleet_common::report::FleetReport;
use fleet_common::report::OperationResult;
use fleet_common::report::OperationStatus;
use fleet_common::report::Statistics;
use fleet_common::Error;
use fleet_common::ErrorKind;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Run one fleet operation to completion and return the report.
///
/// The only error returned is `CONFIG_INVALID`, surfaced before any I/O;
/// once the configuration validates, a report is produced unconditionally.
pub async fn run(
    cfg: &RunConfig,
    svc: Arc<dyn InstanceService>,
    clock: Arc<dyn Clock>,
    log: &Logger,
    cancel: CancelSignal,
) -> Result<FleetReport, Error> {
    cfg.validate()?;
    let cfg = cfg.normalized();
    let run_started = Instant::now();
    let started_at = clock.now();
    info!(
        log,
        "fleet run starting";
        "operation" => %cfg.operation,
        "project" => %cfg.project,
        "locations" => cfg.locations.join(","),
        "dry_run" => cfg.dry_run,
        "max_parallel" => cfg.max_parallel,
    );

    let mut notes: Vec<String> = Vec::new();
    let discovered = discover(&cfg, &*svc, log, &mut notes).await;

    let (candidates, mut results) = admit(&cfg, discovered, log);
    dispatch(&cfg, svc, clock.clone(), log, cancel, candidates, &mut results)
        .await;

    results.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let statistics = Statistics::from_results(&results);
    let finished_at = clock.now();
    info!(
        log,
        "fleet run complete";
        "total" => statistics.total,
        "succeeded" => statistics.succeeded,
        "failed" => statistics.failed,
        "skipped" => statistics.skipped,
    );

    Ok(FleetReport {
        started_at,
        finished_at,
        duration_seconds: (Instant::now() - run_started).as_secs_f64(),
        config: cfg,
        statistics,
        results,
        message: if notes.is_empty() { None } else { Some(notes.join("; ")) },
    })
}

/// Enumerate candidate instances across all configured locations,
/// preserving location order and per-location listing order.
async fn discover(
    cfg: &RunConfig,
    svc: &dyn InstanceService,
    log: &Logger,
    notes: &mut Vec<String>,
) -> Vec<InstanceSnapshot> {
    let mut discovered = Vec::new();
    for location in &cfg.locations {
        match svc.list_instances(&cfg.project, location).await {
            Ok(snapshots) => {
                info!(
                    log,
                    "scanned location";
                    "location" => %location,
                    "instances" => snapshots.len(),
                );
                discovered.extend(snapshots);
            }
            Err(error) if error.kind() == ErrorKind::AuthFailed => {
                // This will recur for every location; stop scanning.
                error!(
                    log,
                    "authentication failed during discovery";
                    "location" => %location,
                    "error" => %error,
                );
                notes.push(format!("discovery aborted: {error}"));
                break;
            }
            Err(error) => {
                error!(
                    log,
                    "failed to list instances";
                    "location" => %location,
                    "error" => %error,
                );
                notes.push(format!(
                    "failed to list instances in {location}: {error}"
                ));
            }
        }
    }

    if let Some(filter) = &cfg.instance {
        discovered.retain(|snapshot| &snapshot.short_name == filter);
        if discovered.is_empty() {
            warn!(
                log,
                "instance filter matched nothing";
                "instance" => %filter,
            );
            notes.push(format!(
                "instance {filter:?} not found in any scanned location"
            ));
        }
    }
    discovered
}

/// Reject instances whose state is unknown to the schema; everything else
/// becomes a dispatch candidate.
fn admit(
    cfg: &RunConfig,
    discovered: Vec<InstanceSnapshot>,
    log: &Logger,
) -> (VecDeque<InstanceSnapshot>, Vec<OperationResult>) {
    let mut candidates = VecDeque::with_capacity(discovered.len());
    let mut results = Vec::new();
    for snapshot in discovered {
        if snapshot.state == InstanceState::Unknown {
            let raw = snapshot
                .raw_state
                .as_deref()
                .unwrap_or(InstanceState::Unknown.label());
            warn!(
                log,
                "instance state not recognised; skipping";
                "instance" => %snapshot.short_name,
                "location" => %snapshot.location,
                "state" => raw,
            );
            let mut result = OperationResult::new(
                &snapshot.short_name,
                &snapshot.location,
                cfg.operation,
                OperationStatus::Skipped,
            );
            result.error_kind = Some(ErrorKind::Ineligible);
            result.error_message =
                Some(format!("unrecognised instance state {raw:?}"));
            results.push(result);
        } else {
            candidates.push_back(snapshot);
        }
    }
    (candidates, results)
}

/// Run one executor per candidate under the concurrency envelope.
async fn dispatch(
    cfg: &RunConfig,
    svc: Arc<dyn InstanceService>,
    clock: Arc<dyn Clock>,
    log: &Logger,
    mut cancel: CancelSignal,
    mut queue: VecDeque<InstanceSnapshot>,
    results: &mut Vec<OperationResult>,
) {
    let semaphore = Arc::new(Semaphore::new(cfg.max_parallel));
    let mut workers: JoinSet<OperationResult> = JoinSet::new();
    let mut identities: HashMap<task::Id, (String, String)> = HashMap::new();
    let mut last_dispatch: Option<Instant> = None;
    let mut auth_failed = false;
    let mut run_cancelled = false;

    while let Some(snapshot) = queue.pop_front() {
        if run_cancelled || is_cancelled(&cancel) {
            run_cancelled = true;
            let mut result = OperationResult::new(
                &snapshot.short_name,
                &snapshot.location,
                cfg.operation,
                OperationStatus::Failed,
            );
            result.error_kind = Some(ErrorKind::Cancelled);
            result.error_message =
                Some("run cancelled before dispatch".to_string());
            results.push(result);
            continue;
        }
        if auth_failed {
            let mut result = OperationResult::new(
                &snapshot.short_name,
                &snapshot.location,
                cfg.operation,
                OperationStatus::Skipped,
            );
            result.error_kind = Some(ErrorKind::AuthFailed);
            result.error_message = Some(
                "skipped: provider rejected credentials earlier in the run"
                    .to_string(),
            );
            results.push(result);
            continue;
        }

        // Stagger gate: a minimum spacing since the previous dispatch,
        // regardless of available capacity.
        if let Some(previous) = last_dispatch {
            let stagger = cfg.stagger_delay();
            let since = Instant::now().saturating_duration_since(previous);
            if since < stagger {
                if sleep_unless_cancelled(
                    &*clock,
                    stagger - since,
                    &mut cancel,
                )
                .await
                {
                    run_cancelled = true;
                    queue.push_front(snapshot);
                    continue;
                }
            }
        }

        // Capacity gate: wait for a slot, reaping completed workers while
        // we do (a completed worker may reveal an auth failure that makes
        // dispatching more work pointless).
        let mut permit = None;
        while permit.is_none() && !auth_failed && !run_cancelled {
            tokio::select! {
                acquired = semaphore.clone().acquire_owned() => {
                    permit =
                        Some(acquired.expect("semaphore is never closed"));
                }
                Some(joined) = workers.join_next_with_id() => {
                    record_completion(
                        cfg,
                        joined,
                        &mut identities,
                        results,
                        &mut auth_failed,
                        log,
                    );
                }
                _ = cancelled(&mut cancel) => {
                    run_cancelled = true;
                }
            }
        }
        let Some(permit) = permit else {
            queue.push_front(snapshot);
            continue;
        };

        // Reap anything that finished while we waited for the slot; a
        // just-completed worker may have hit an auth failure that makes
        // dispatching this instance pointless.
        while let Some(joined) = workers.try_join_next_with_id() {
            record_completion(
                cfg,
                joined,
                &mut identities,
                results,
                &mut auth_failed,
                log,
            );
        }
        if auth_failed || is_cancelled(&cancel) {
            queue.push_front(snapshot);
            continue;
        }

        last_dispatch = Some(Instant::now());
        let executor = InstanceExecutor::new(
            svc.clone(),
            clock.clone(),
            cfg.clone(),
            log,
            cancel.clone(),
        );
        let identity =
            (snapshot.short_name.clone(), snapshot.location.clone());
        let handle = workers.spawn(async move {
            let _permit = permit;
            executor.execute(snapshot).await
        });
        identities.insert(handle.id(), identity);
    }

    // Wait out the in-flight workers; cancellation is their own concern.
    while let Some(joined) = workers.join_next_with_id().await {
        record_completion(
            cfg,
            joined,
            &mut identities,
            results,
            &mut auth_failed,
            log,
        );
    }
}

/// Fold one worker completion into the result list.
///
/// A worker that dies without delivering a result (which the executor is
/// designed never to do) still yields exactly one result for its instance.
fn record_completion(
    cfg: &RunConfig,
    joined: Result<(task::Id, OperationResult), task::JoinError>,
    identities: &mut HashMap<task::Id, (String, String)>,
    results: &mut Vec<OperationResult>,
    auth_failed: &mut bool,
    log: &Logger,
) {
    match joined {
        Ok((id, result)) => {
            identities.remove(&id);
            if result.error_kind == Some(ErrorKind::AuthFailed) {
                *auth_failed = true;
            }
            results.push(result);
        }
        Err(join_error) => {
            let (instance, location) = identities
                .remove(&join_error.id())
                .unwrap_or_else(|| ("unknown".to_string(), String::new()));
            error!(
                log,
                "worker terminated without a result";
                "instance" => %instance,
                "location" => %location,
                "error" => %join_error,
            );
            let mut result = OperationResult::new(
                &instance,
                &location,
                cfg.operation,
                OperationStatus::Failed,
            );
            result.error_kind = Some(ErrorKind::Unexpected);
            result.error_message =
                Some(format!("worker terminated abnormally: {join_error}"));
            results.push(result);
        }
    }
}
