// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run configuration for a single engine invocation

use crate::error::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Which lifecycle transition this run performs
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
pub enum OperationKind {
    Upgrade,
    Rollback,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Upgrade => "upgrade",
            OperationKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub const MAX_PARALLEL_LIMIT: usize = 100;
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// Configuration for one engine run
///
/// Validated once at entry via [`RunConfig::validate`]; every downstream
/// component consumes sub-fields by value and assumes they are valid.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub operation: OperationKind,
    /// Opaque identifier of the cloud tenancy.
    pub project: String,
    /// Zone identifiers to scan, in order.  Duplicates are removed stably
    /// by [`RunConfig::normalized`].
    pub locations: Vec<String>,
    /// Optional single-instance filter: only the instance with this short
    /// name is acted upon.
    pub instance: Option<String>,
    pub dry_run: bool,
    pub max_parallel: usize,
    /// Per-instance wall time, charged from the moment the instance is
    /// ready for its operation.
    #[serde(rename = "operationTimeout")]
    pub operation_timeout_secs: u64,
    #[serde(rename = "pollInterval")]
    pub poll_interval_secs: u64,
    #[serde(rename = "healthCheckTimeout")]
    pub health_check_timeout_secs: u64,
    /// Minimum spacing between successive worker dispatches.  May be zero.
    #[serde(rename = "staggerDelay")]
    pub stagger_delay_secs: f64,
    /// Compensate a failed upgrade with an automatic rollback.  Meaningful
    /// only when `operation` is `UPGRADE`.
    pub rollback_on_failure: bool,
}

impl RunConfig {
    /// A configuration with the documented defaults for the given
    /// operation, project and locations.
    pub fn new<S: Into<String>>(
        operation: OperationKind,
        project: S,
        locations: Vec<String>,
    ) -> RunConfig {
        RunConfig {
            operation,
            project: project.into(),
            locations,
            instance: None,
            dry_run: false,
            max_parallel: 5,
            operation_timeout_secs: 7200,
            poll_interval_secs: 20,
            health_check_timeout_secs: 600,
            stagger_delay_secs: 3.0,
            rollback_on_failure: false,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_secs_f64(self.stagger_delay_secs)
    }

    /// Check the configuration invariants, surfacing violations as
    /// [`Error::ConfigInvalid`] before any I/O happens.
    pub fn validate(&self) -> Result<(), Error> {
        if self.project.is_empty() {
            return Err(Error::config_invalid("project must not be empty"));
        }
        if self.locations.is_empty() {
            return Err(Error::config_invalid(
                "at least one location is required",
            ));
        }
        if self.max_parallel < 1 || self.max_parallel > MAX_PARALLEL_LIMIT {
            return Err(Error::config_invalid(format!(
                "maxParallel must be within [1, {}], got {}",
                MAX_PARALLEL_LIMIT, self.max_parallel
            )));
        }
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(Error::config_invalid(format!(
                "pollInterval must be at least {} seconds, got {}",
                MIN_POLL_INTERVAL_SECS, self.poll_interval_secs
            )));
        }
        if self.poll_interval_secs > self.operation_timeout_secs {
            return Err(Error::config_invalid(format!(
                "pollInterval ({}s) must not exceed operationTimeout ({}s)",
                self.poll_interval_secs, self.operation_timeout_secs
            )));
        }
        if self.health_check_timeout_secs > self.operation_timeout_secs {
            return Err(Error::config_invalid(format!(
                "healthCheckTimeout ({}s) must not exceed \
                 operationTimeout ({}s)",
                self.health_check_timeout_secs, self.operation_timeout_secs
            )));
        }
        if !self.stagger_delay_secs.is_finite() || self.stagger_delay_secs < 0.0
        {
            return Err(Error::config_invalid(format!(
                "staggerDelay must be a non-negative number, got {}",
                self.stagger_delay_secs
            )));
        }
        Ok(())
    }

    /// Returns a copy with duplicate locations removed, keeping the first
    /// occurrence of each.
    pub fn normalized(&self) -> RunConfig {
        let mut seen = std::collections::BTreeSet::new();
        let mut config = self.clone();
        config.locations.retain(|loc| seen.insert(loc.clone()));
        config
    }
}
