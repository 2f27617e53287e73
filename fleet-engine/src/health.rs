// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-operation health verification
//!
//! After an operation resolves (and after starting a stopped instance),
//! the engine waits for the instance to come back `ACTIVE`.  An `UNKNOWN`
//! health signal is accepted: some provider builds never publish one, and
//! refusing it would produce false negatives.

use crate::clock::sleep_unless_cancelled;
use crate::clock::CancelSignal;
use crate::clock::Clock;
use crate::service::InstanceService;
use crate::tracker::Deadline;
use fleet_common::instance::HealthState;
use fleet_common::instance::InstanceState;
use fleet_common::Error;
use slog::debug;
use slog::Logger;
use std::time::Duration;

/// Wait until the instance reports `ACTIVE` with an acceptable health
/// signal, or fail.
///
/// States on the way up (`PROVISIONING`, `STARTING`, `INITIALIZING`) are
/// tolerated as transient; any other non-`ACTIVE` state is a verification
/// failure.  Read errors bubble immediately: retry policy belongs to the
/// operation tracker, not here.
pub async fn verify_health(
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    log: &Logger,
    name: &str,
    poll_interval: Duration,
    deadline: &Deadline,
    cancel: &mut CancelSignal,
) -> Result<(), Error> {
    loop {
        let snapshot = svc.get_instance(name).await?;
        debug!(
            log,
            "health check";
            "state" => %snapshot.state,
            "health" => %snapshot.health_state,
            "elapsed_ms" => deadline.elapsed().as_millis() as u64,
        );

        match snapshot.state {
            InstanceState::Active => {
                return match snapshot.health_state {
                    HealthState::Healthy | HealthState::Unknown => Ok(()),
                    HealthState::Unhealthy => Err(Error::unexpected(format!(
                        "instance {} is ACTIVE but reports UNHEALTHY",
                        snapshot.short_name
                    ))),
                };
            }
            state if state.is_transitional() => (),
            state => {
                return Err(Error::unexpected(format!(
                    "instance {} entered unexpected state {} during \
                     verification",
                    snapshot.short_name, state
                )));
            }
        }

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.timeout_error());
        }
        let wait = poll_interval.min(remaining);
        if sleep_unless_cancelled(clock, wait, cancel).await {
            return Err(Error::Cancelled);
        }
        if wait < poll_interval {
            return Err(deadline.timeout_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::cancel_channel;
    use crate::clock::SystemClock;
    use crate::testutil::snapshot;
    use crate::testutil::StubService;
    use slog::o;
    use slog::Logger;
    use tokio::time::Instant;

    const POLL: Duration = Duration::from_secs(20);

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    async fn verify(
        svc: &StubService,
        budget: Duration,
    ) -> Result<(), Error> {
        let (_tx, mut cancel) = cancel_channel();
        let deadline = Deadline::after(budget);
        verify_health(
            svc,
            &SystemClock,
            &log(),
            "projects/test/locations/a/instances/i1",
            POLL,
            &deadline,
            &mut cancel,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_and_healthy_passes() {
        let svc = StubService::default();
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Active,
            HealthState::Healthy,
        )));
        verify(&svc, Duration::from_secs(600)).await.expect("healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_health_is_accepted() {
        let svc = StubService::default();
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Active,
            HealthState::Unknown,
        )));
        verify(&svc, Duration::from_secs(600))
            .await
            .expect("unknown health must pass");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_fails() {
        let svc = StubService::default();
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Active,
            HealthState::Unhealthy,
        )));
        let error = verify(&svc, Duration::from_secs(600))
            .await
            .expect_err("unhealthy must fail");
        assert!(matches!(error, Error::Unexpected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitional_states_are_waited_out() {
        let svc = StubService::default();
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Provisioning,
            HealthState::Unknown,
        )));
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Starting,
            HealthState::Unknown,
        )));
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Active,
            HealthState::Healthy,
        )));
        let started = Instant::now();
        verify(&svc, Duration::from_secs(600)).await.expect("eventually up");
        assert_eq!(Instant::now() - started, POLL * 2);
        assert_eq!(svc.gets_taken(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_bad_state_fails_fast() {
        let svc = StubService::default();
        svc.push_get(Ok(snapshot(
            "i1",
            "a",
            InstanceState::Stopped,
            HealthState::Unknown,
        )));
        let error = verify(&svc, Duration::from_secs(600))
            .await
            .expect_err("stopped must fail verification");
        assert!(matches!(error, Error::Unexpected { .. }));
        assert_eq!(svc.gets_taken(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_transitional() {
        let svc = StubService::default();
        for _ in 0..8 {
            svc.push_get(Ok(snapshot(
                "i1",
                "a",
                InstanceState::Initializing,
                HealthState::Unknown,
            )));
        }
        let error = verify(&svc, Duration::from_secs(50))
            .await
            .expect_err("must time out");
        assert!(matches!(error, Error::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_bubbles() {
        let svc = StubService::default();
        svc.push_get(Err(Error::transient("connection reset")));
        let error = verify(&svc, Duration::from_secs(600))
            .await
            .expect_err("read error must bubble");
        assert_eq!(error, Error::transient("connection reset"));
        assert_eq!(svc.gets_taken(), 1);
    }
}
