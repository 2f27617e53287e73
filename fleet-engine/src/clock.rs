// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time and cancellation seams
//!
//! The engine takes its clock and its cancellation signal as explicit
//! parameters rather than reaching for ambient time, so that the test
//! suite can drive scheduling deterministically under tokio's paused
//! clock and cancel runs cooperatively.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;

/// Source of timestamps and sleeps for the engine
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wall-clock timestamp for report fields.
    fn now(&self) -> DateTime<Utc>;

    /// Pause the calling worker.  Implementations must be cancel-safe:
    /// dropping the returned future abandons the sleep.
    async fn sleep(&self, duration: Duration);
}

/// The production clock: `chrono` timestamps and tokio sleeps
///
/// Under `#[tokio::test(start_paused = true)]` the sleeps consume virtual
/// time, which is what makes the scheduling tests deterministic.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Cooperative cancellation signal handed to every worker and poll loop
///
/// The sender flips the value to `true` exactly once; receivers treat a
/// dropped sender as "never cancelled".
pub type CancelSignal = watch::Receiver<bool>;

/// Create a cancellation signal pair.
pub fn cancel_channel() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

/// A signal that never fires, for consumers without an interrupt source.
pub fn never_cancelled() -> CancelSignal {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive forever so the channel never closes.
    std::mem::forget(tx);
    rx
}

/// Returns whether cancellation has been observed.
pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    *cancel.borrow()
}

/// Resolve once cancellation fires; never resolves otherwise.
pub async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

/// Sleep for `duration` unless cancellation fires first.  Returns true if
/// the sleep was interrupted (or cancellation was already set).
pub async fn sleep_unless_cancelled(
    clock: &dyn Clock,
    duration: Duration,
    cancel: &mut CancelSignal,
) -> bool {
    if is_cancelled(cancel) {
        return true;
    }
    tokio::select! {
        _ = clock.sleep(duration) => false,
        _ = cancelled(cancel) => true,
    }
}
