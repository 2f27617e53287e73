// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance snapshots and lifecycle states

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a managed notebook instance
///
/// This is the closed set the engine reasons about.  Provider state strings
/// outside this set parse to [`InstanceState::Unknown`] and are skipped at
/// admission time rather than acted upon.
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
pub enum InstanceState {
    Active,
    Stopped,
    Suspended,
    Starting,
    Stopping,
    Provisioning,
    Upgrading,
    Initializing,
    Suspending,
    Unknown,
}

impl InstanceState {
    /// Parse a provider state string, mapping anything unrecognised to
    /// [`InstanceState::Unknown`].
    pub fn parse(value: &str) -> InstanceState {
        InstanceState::try_from(value).unwrap_or(InstanceState::Unknown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstanceState::Active => "ACTIVE",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Suspended => "SUSPENDED",
            InstanceState::Starting => "STARTING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Provisioning => "PROVISIONING",
            InstanceState::Upgrading => "UPGRADING",
            InstanceState::Initializing => "INITIALIZING",
            InstanceState::Suspending => "SUSPENDING",
            InstanceState::Unknown => "UNKNOWN",
        }
    }

    /// Returns true if an instance in this state can be started by the
    /// engine as part of normalisation.
    pub fn is_startable(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Suspended)
    }

    /// Returns true for states the health verifier tolerates as transient
    /// on the way to `ACTIVE`.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning
                | InstanceState::Starting
                | InstanceState::Initializing
        )
    }
}

impl TryFrom<&str> for InstanceState {
    type Error = String;

    fn try_from(variant: &str) -> Result<Self, Self::Error> {
        let r = match variant {
            "ACTIVE" => InstanceState::Active,
            "STOPPED" => InstanceState::Stopped,
            "SUSPENDED" => InstanceState::Suspended,
            "STARTING" => InstanceState::Starting,
            "STOPPING" => InstanceState::Stopping,
            "PROVISIONING" => InstanceState::Provisioning,
            "UPGRADING" => InstanceState::Upgrading,
            "INITIALIZING" => InstanceState::Initializing,
            "SUSPENDING" => InstanceState::Suspending,
            "UNKNOWN" => InstanceState::Unknown,
            _ => return Err(format!("unexpected instance state {variant:?}")),
        };
        Ok(r)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Health signal published by the provider alongside the lifecycle state
///
/// Some provider builds never publish a health signal; `Unknown` is
/// therefore an acceptable answer during verification, not a failure.
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
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthState {
    pub fn parse(value: &str) -> HealthState {
        match value {
            "HEALTHY" => HealthState::Healthy,
            "UNHEALTHY" => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Unhealthy => "UNHEALTHY",
            HealthState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Immutable observation of one instance, taken once at discovery
///
/// Re-reads during polling produce separate snapshots used only for
/// transient state checks; the discovery snapshot is never mutated.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// Fully qualified resource identifier.
    pub name: String,
    /// Terminal segment of `name`.
    pub short_name: String,
    pub location: String,
    pub state: InstanceState,
    /// The provider's state string when `state` is `UNKNOWN`, so admission
    /// can name the unrecognised value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_state: Option<String>,
    pub health_state: HealthState,
    pub current_version: String,
    pub available_upgrade_version: Option<String>,
    pub previous_version: Option<String>,
    pub last_upgrade_at: Option<DateTime<Utc>>,
    pub rollback_window_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl InstanceSnapshot {
    /// Extract the terminal segment of a fully qualified resource name.
    pub fn short_name_of(name: &str) -> &str {
        name.rsplit('/').next().unwrap_or(name)
    }
}

/// Opaque identifier for a provider-side long-running operation
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OperationHandle(pub String);

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OperationHandle {
    fn from(name: String) -> OperationHandle {
        OperationHandle(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_states() {
        assert_eq!(InstanceState::parse("ACTIVE"), InstanceState::Active);
        assert_eq!(InstanceState::parse("SUSPENDED"), InstanceState::Suspended);
        assert_eq!(
            InstanceState::parse("INITIALIZING"),
            InstanceState::Initializing
        );
    }

    #[test]
    fn test_parse_unknown_state() {
        assert_eq!(InstanceState::parse("DELETED"), InstanceState::Unknown);
        assert_eq!(InstanceState::parse(""), InstanceState::Unknown);
        assert!(InstanceState::try_from("DELETED").is_err());
    }

    #[test]
    fn test_label_round_trips() {
        for state in [
            InstanceState::Active,
            InstanceState::Stopped,
            InstanceState::Suspended,
            InstanceState::Starting,
            InstanceState::Stopping,
            InstanceState::Provisioning,
            InstanceState::Upgrading,
            InstanceState::Initializing,
            InstanceState::Suspending,
            InstanceState::Unknown,
        ] {
            assert_eq!(InstanceState::parse(state.label()), state);
        }
    }

    #[test]
    fn test_short_name_extraction() {
        assert_eq!(
            InstanceSnapshot::short_name_of(
                "projects/p/locations/zone-a/instances/nb-1"
            ),
            "nb-1"
        );
        assert_eq!(InstanceSnapshot::short_name_of("bare"), "bare");
    }

    #[test]
    fn test_transitional_states() {
        assert!(InstanceState::Provisioning.is_transitional());
        assert!(InstanceState::Starting.is_transitional());
        assert!(InstanceState::Initializing.is_transitional());
        assert!(!InstanceState::Stopping.is_transitional());
        assert!(!InstanceState::Active.is_transitional());
    }
}
