// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance results and the per-run fleet report

use crate::config::OperationKind;
use crate::config::RunConfig;
use crate::error::ErrorKind;
use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Terminal status of one per-instance operation attempt
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// No upgrade was available; nothing to do.
    UpToDate,
    /// The instance would have been acted upon, but the run was a dry run.
    DryRun,
    /// A provider operation was begun but its outcome was never observed.
    Started,
    Succeeded,
    Failed,
    Skipped,
    /// The upgrade failed and the automatic compensating rollback
    /// completed and verified.
    Compensated,
}

impl OperationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OperationStatus::UpToDate => "UP_TO_DATE",
            OperationStatus::DryRun => "DRY_RUN",
            OperationStatus::Started => "STARTED",
            OperationStatus::Succeeded => "SUCCEEDED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Skipped => "SKIPPED",
            OperationStatus::Compensated => "COMPENSATED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Verdict of one named rollback pre-check
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckVerdict {
    Pass,
    Fail,
    Skipped,
}

/// Outcome of one named rollback eligibility pre-check
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCheck {
    pub name: String,
    pub verdict: CheckVerdict,
    pub message: String,
}

impl PreCheck {
    pub fn new<N, M>(name: N, verdict: CheckVerdict, message: M) -> PreCheck
    where
        N: Into<String>,
        M: Into<String>,
    {
        PreCheck { name: name.into(), verdict, message: message.into() }
    }
}

/// The outcome recorded for one discovered instance
///
/// Exactly one of these is emitted per discovered instance, even when the
/// worker hits an internal error.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Instance short name.
    pub instance: String,
    pub location: String,
    pub operation: OperationKind,
    pub status: OperationStatus,
    pub target_version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_kind: Option<ErrorKind>,
    /// Sanitised one-line message; never carries stack-trace text.
    pub error_message: Option<String>,
    /// True if a failing upgrade was successfully rolled back.
    pub compensated: bool,
    /// Rollback only; ordered as evaluated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_checks: Vec<PreCheck>,
}

impl OperationResult {
    pub fn new(
        instance: &str,
        location: &str,
        operation: OperationKind,
        status: OperationStatus,
    ) -> OperationResult {
        OperationResult {
            instance: instance.to_string(),
            location: location.to_string(),
            operation,
            status,
            target_version: None,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            error_kind: None,
            error_message: None,
            compensated: false,
            pre_checks: Vec::new(),
        }
    }

    /// Sort key for the report's deterministic ordering.
    pub fn sort_key(&self) -> (String, String) {
        (self.location.clone(), self.instance.clone())
    }
}

/// Counters derived once from the final result list
///
/// `total` always equals the number of results; `started` partitions into
/// `succeeded`, `failed` and `compensated`; `eligible` additionally counts
/// dry-run candidates that would have been acted upon.
#[derive(
    Copy, Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq,
    Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total: usize,
    pub eligible: usize,
    pub up_to_date: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub compensated: usize,
}

impl Statistics {
    pub fn from_results(results: &[OperationResult]) -> Statistics {
        let mut stats = Statistics { total: results.len(), ..Default::default() };
        for result in results {
            match result.status {
                OperationStatus::UpToDate => stats.up_to_date += 1,
                OperationStatus::Skipped => stats.skipped += 1,
                OperationStatus::DryRun => stats.eligible += 1,
                OperationStatus::Succeeded => stats.succeeded += 1,
                OperationStatus::Failed | OperationStatus::Started => {
                    stats.failed += 1
                }
                OperationStatus::Compensated => stats.compensated += 1,
            }
        }
        stats.started = stats.succeeded + stats.failed + stats.compensated;
        stats.eligible += stats.started;
        stats
    }
}

/// The per-run report: timing, configuration echo, derived statistics and
/// the full ordered result list
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub config: RunConfig,
    pub statistics: Statistics,
    /// Results ordered by `(location, instance)`.
    pub results: Vec<OperationResult>,
    /// Top-level note, e.g. when a single-instance filter matched nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: OperationStatus) -> OperationResult {
        OperationResult::new("i", "loc", OperationKind::Upgrade, status)
    }

    #[test]
    fn test_statistics_partition_results() {
        let results = vec![
            result(OperationStatus::UpToDate),
            result(OperationStatus::UpToDate),
            result(OperationStatus::Succeeded),
            result(OperationStatus::Failed),
            result(OperationStatus::Compensated),
            result(OperationStatus::Skipped),
            result(OperationStatus::DryRun),
        ];
        let stats = Statistics::from_results(&results);
        assert_eq!(stats.total, 7);
        assert_eq!(stats.up_to_date, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.compensated, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.started, 3);
        assert_eq!(stats.eligible, 4);
        // The partition invariant: every result is counted exactly once.
        assert_eq!(
            stats.total,
            stats.up_to_date + stats.skipped + stats.eligible
        );
    }

    #[test]
    fn test_statistics_empty_fleet() {
        let stats = Statistics::from_results(&[]);
        assert_eq!(stats, Statistics::default());
    }

    #[test]
    fn test_live_run_invariant() {
        let results = vec![
            result(OperationStatus::UpToDate),
            result(OperationStatus::Succeeded),
            result(OperationStatus::Skipped),
        ];
        let stats = Statistics::from_results(&results);
        assert_eq!(
            stats.total,
            stats.up_to_date + stats.started + stats.skipped
        );
    }

    #[test]
    fn test_status_field_names_follow_schema() {
        let mut r = result(OperationStatus::Failed);
        r.error_kind = Some(ErrorKind::Timeout);
        let value = serde_json::to_value(&r).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "instance",
            "location",
            "operation",
            "status",
            "targetVersion",
            "startedAt",
            "finishedAt",
            "durationSeconds",
            "errorKind",
            "errorMessage",
            "compensated",
        ] {
            assert!(object.contains_key(key), "missing result key {key}");
        }
        assert_eq!(object["status"], "FAILED");
        assert_eq!(object["errorKind"], "TIMEOUT");
        // preChecks is omitted when empty.
        assert!(!object.contains_key("preChecks"));
    }
}
