// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry policies for transient provider failures
//!
//! These policies are used when an operation against the provider may
//! transiently fail due to throttling, an overloaded frontend, or an
//! inaccessible network.  All retrying in the engine is centralised in the
//! operation tracker; this module only constructs the policies.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::ExponentialBackoff;
pub use ::backoff::ExponentialBackoffBuilder;

/// Ceiling on any single backoff interval, regardless of poll cadence.
const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(120);

/// Return the backoff policy applied to transient provider errors while
/// polling or starting a long-running operation.
///
/// Intervals start at the configured poll interval and roughly double,
/// capped at five poll intervals or [`MAX_BACKOFF_INTERVAL`], whichever is
/// smaller.  The policy never gives up on its own: the caller bounds the
/// number of attempts and the wall-clock budget.
pub fn poll_retry_policy(poll_interval: Duration) -> ExponentialBackoff {
    let cap = Duration::min(poll_interval * 5, MAX_BACKOFF_INTERVAL);
    ExponentialBackoffBuilder::new()
        .with_initial_interval(poll_interval)
        .with_multiplier(2.0)
        .with_max_interval(cap)
        .with_max_elapsed_time(None)
        .build()
}
