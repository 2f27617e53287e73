// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-running operation tracking
//!
//! All retrying in the engine lives here: both the poll loop that waits
//! for a provider operation to resolve and the backoff wrapper applied to
//! individual provider calls that may fail transiently.  Other components
//! never retry; they surface errors to the per-instance executor.

use crate::clock::sleep_unless_cancelled;
use crate::clock::CancelSignal;
use crate::clock::Clock;
use crate::service::InstanceService;
use fleet_common::backoff::poll_retry_policy;
use fleet_common::backoff::Backoff;
use fleet_common::instance::OperationHandle;
use fleet_common::Error;
use futures::Future;
use rand::Rng;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum consecutive transient failures before the error is surfaced.
const MAX_TRANSIENT_RETRIES: usize = 5;

/// A wall-clock budget charged from a fixed starting instant
///
/// Uses the tokio clock so that paused-time tests advance it virtually.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Deadline {
        let started = Instant::now();
        Deadline { started, at: started + budget }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn timeout_error(&self) -> Error {
        Error::timeout(self.elapsed())
    }
}

/// Run one provider call, retrying transient failures with exponential
/// backoff.
///
/// Retries at most [`MAX_TRANSIENT_RETRIES`] times, never sleeps past the
/// deadline, and returns `CANCELLED` without issuing further calls once
/// the cancellation signal fires.  Non-retryable errors are returned on
/// the first occurrence.
pub async fn call_with_backoff<T, F, Fut>(
    clock: &dyn Clock,
    log: &Logger,
    poll_interval: Duration,
    deadline: &Deadline,
    cancel: &mut CancelSignal,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut policy = poll_retry_policy(poll_interval);
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.retryable() => return Err(error),
            Err(error) => error,
        };

        retries += 1;
        if retries > MAX_TRANSIENT_RETRIES {
            warn!(
                log,
                "transient error persisted past the retry ceiling";
                "error" => %error,
                "retries" => retries - 1,
            );
            return Err(error);
        }

        let delay = policy
            .next_backoff()
            .unwrap_or_else(|| poll_retry_policy(poll_interval).max_interval);
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.timeout_error());
        }
        warn!(
            log,
            "transient provider error, backing off";
            "error" => %error,
            "retry" => retries,
            "delay_ms" => delay.as_millis() as u64,
        );
        if sleep_unless_cancelled(clock, delay.min(remaining), cancel).await {
            return Err(Error::Cancelled);
        }
    }
}

/// Block until the given operation resolves, the deadline passes, or
/// cancellation fires.
///
/// The first poll happens one poll interval after the call; subsequent
/// polls are jittered by up to ±20% to decorrelate workers.  A resolved
/// operation returns `Ok(())` on success or the provider's error; an
/// exhausted deadline returns `TIMEOUT`; cancellation returns `CANCELLED`
/// and makes no further provider calls.
pub async fn track_operation(
    svc: &dyn InstanceService,
    clock: &dyn Clock,
    log: &Logger,
    handle: &OperationHandle,
    poll_interval: Duration,
    deadline: &Deadline,
    cancel: &mut CancelSignal,
) -> Result<(), Error> {
    let mut first_poll = true;
    loop {
        let delay = if first_poll {
            poll_interval
        } else {
            jittered(poll_interval)
        };
        first_poll = false;

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.timeout_error());
        }
        let clamped = delay.min(remaining);
        if sleep_unless_cancelled(clock, clamped, cancel).await {
            return Err(Error::Cancelled);
        }
        if clamped < delay {
            // The full poll delay did not fit in the budget.
            return Err(deadline.timeout_error());
        }

        let poll = call_with_backoff(
            clock,
            log,
            poll_interval,
            deadline,
            cancel,
            || svc.get_operation(handle),
        )
        .await?;

        if !poll.done {
            debug!(
                log,
                "operation still running";
                "operation" => %handle,
                "elapsed_ms" => deadline.elapsed().as_millis() as u64,
            );
            continue;
        }
        return match poll.error {
            None => Ok(()),
            Some(error) => Err(error),
        };
    }
}

fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}
