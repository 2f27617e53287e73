// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rollback eligibility preflight
//!
//! A pure decision over an instance snapshot: no I/O, total over its
//! inputs.  Every check runs even when an earlier one fails, so the
//! operator gets the full diagnostic picture; eligibility is the
//! conjunction of the verdicts.

use chrono::DateTime;
use chrono::Utc;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use fleet_common::report::CheckVerdict;
use fleet_common::report::PreCheck;

pub const CHECK_INSTANCE_STATE: &str = "instance_state";
pub const CHECK_UPGRADE_HISTORY: &str = "upgrade_history";
pub const CHECK_PREVIOUS_VERSION: &str = "previous_version";
pub const CHECK_ROLLBACK_WINDOW: &str = "rollback_window";

/// Verdict of the rollback eligibility preflight
#[derive(Clone, Debug, PartialEq)]
pub struct Eligibility {
    pub eligible: bool,
    /// All checks, in the fixed evaluation order.
    pub checks: Vec<PreCheck>,
}

impl Eligibility {
    /// The first failing check, if any.
    pub fn first_failure(&self) -> Option<&PreCheck> {
        self.checks.iter().find(|check| check.verdict == CheckVerdict::Fail)
    }

    /// One-line summary of every failing check.
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|check| check.verdict == CheckVerdict::Fail)
            .map(|check| format!("{}: {}", check.name, check.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Evaluate rollback eligibility for one instance.
///
/// `start_pending` is set when a dry run encounters a stopped or suspended
/// instance: a live run would have started it before this point, so the
/// state check reports `SKIPPED` instead of failing, and the remaining
/// checks are still evaluated on the instance's metadata.
pub fn evaluate(
    snapshot: &InstanceSnapshot,
    now: DateTime<Utc>,
    start_pending: bool,
) -> Eligibility {
    let mut checks = Vec::with_capacity(4);

    checks.push(check_instance_state(snapshot, start_pending));
    checks.push(check_upgrade_history(snapshot));
    checks.push(check_previous_version(snapshot));
    checks.push(check_rollback_window(snapshot, now));

    let eligible =
        checks.iter().all(|check| check.verdict != CheckVerdict::Fail);
    Eligibility { eligible, checks }
}

fn check_instance_state(
    snapshot: &InstanceSnapshot,
    start_pending: bool,
) -> PreCheck {
    if snapshot.state == InstanceState::Active {
        return PreCheck::new(
            CHECK_INSTANCE_STATE,
            CheckVerdict::Pass,
            "instance is ACTIVE",
        );
    }
    if start_pending && snapshot.state.is_startable() {
        return PreCheck::new(
            CHECK_INSTANCE_STATE,
            CheckVerdict::Skipped,
            "would be started before rollback",
        );
    }
    PreCheck::new(
        CHECK_INSTANCE_STATE,
        CheckVerdict::Fail,
        format!("instance is not ACTIVE (state={})", snapshot.state),
    )
}

fn check_upgrade_history(snapshot: &InstanceSnapshot) -> PreCheck {
    match snapshot.last_upgrade_at {
        Some(at) => PreCheck::new(
            CHECK_UPGRADE_HISTORY,
            CheckVerdict::Pass,
            format!("last upgraded at {}", at.to_rfc3339()),
        ),
        None => PreCheck::new(
            CHECK_UPGRADE_HISTORY,
            CheckVerdict::Fail,
            "no completed upgrade recorded for this instance",
        ),
    }
}

fn check_previous_version(snapshot: &InstanceSnapshot) -> PreCheck {
    match snapshot.previous_version.as_deref() {
        Some(version) if !version.is_empty() => PreCheck::new(
            CHECK_PREVIOUS_VERSION,
            CheckVerdict::Pass,
            format!("previous version {version} captured"),
        ),
        _ => PreCheck::new(
            CHECK_PREVIOUS_VERSION,
            CheckVerdict::Fail,
            "no previous version captured",
        ),
    }
}

fn check_rollback_window(
    snapshot: &InstanceSnapshot,
    now: DateTime<Utc>,
) -> PreCheck {
    match snapshot.rollback_window_expires_at {
        // The provider published no expiry; treat the window as open.
        None => PreCheck::new(
            CHECK_ROLLBACK_WINDOW,
            CheckVerdict::Pass,
            "no expiry published; window treated as open",
        ),
        Some(expires) if expires > now => PreCheck::new(
            CHECK_ROLLBACK_WINDOW,
            CheckVerdict::Pass,
            format!("window open until {}", expires.to_rfc3339()),
        ),
        Some(expires) => PreCheck::new(
            CHECK_ROLLBACK_WINDOW,
            CheckVerdict::Fail,
            format!("rollback window expired at {}", expires.to_rfc3339()),
        ),
    }
}
