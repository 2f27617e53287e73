// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire representations of the provider's REST resources
//!
//! Only the fields the engine consumes are modelled; everything else in
//! the provider's documents is ignored on deserialization.

use chrono::DateTime;
use chrono::Utc;
use fleet_common::instance::HealthState;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use serde::Deserialize;
use std::collections::BTreeMap;

/// The provider's instance document
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInstance {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub health_state: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub upgrade_history: Vec<WireUpgradeHistoryEntry>,
    #[serde(default)]
    pub rollback_window_expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUpgradeHistoryEntry {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub target_snapshot: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}

impl WireUpgradeHistoryEntry {
    fn is_completed_upgrade(&self) -> bool {
        self.action.as_deref().map(str::to_ascii_uppercase).as_deref()
            == Some("UPGRADE")
            && self.state.as_deref().map(str::to_ascii_uppercase).as_deref()
                == Some("SUCCEEDED")
    }
}

impl WireInstance {
    /// Derive the engine's immutable snapshot from the wire document,
    /// given the location it was listed in.
    pub fn into_snapshot(self, location: &str) -> InstanceSnapshot {
        let short_name =
            InstanceSnapshot::short_name_of(&self.name).to_string();
        let raw_state = self.state.as_deref().unwrap_or("").to_string();
        let state = InstanceState::parse(&raw_state);

        // The most recent completed upgrade carries the version we came
        // from and the moment the rollback window opened.
        let last_upgrade = self
            .upgrade_history
            .iter()
            .find(|entry| entry.is_completed_upgrade());
        let previous_version =
            last_upgrade.and_then(|entry| entry.version.clone());
        let last_upgrade_at =
            last_upgrade.and_then(|entry| entry.create_time);
        let upgraded_to =
            last_upgrade.and_then(|entry| entry.target_version.clone());

        InstanceSnapshot {
            short_name,
            location: location.to_string(),
            state,
            raw_state: if state == InstanceState::Unknown {
                Some(raw_state)
            } else {
                None
            },
            health_state: self
                .health_state
                .as_deref()
                .map(HealthState::parse)
                .unwrap_or(HealthState::Unknown),
            current_version: self
                .version
                .or(upgraded_to)
                .unwrap_or_else(|| "unknown".to_string()),
            available_upgrade_version: None,
            previous_version,
            last_upgrade_at,
            rollback_window_expires_at: self.rollback_window_expire_time,
            labels: self.labels,
            name: self.name,
        }
    }
}

/// One page of a `list` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInstanceList {
    #[serde(default)]
    pub instances: Vec<WireInstance>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A long-running operation document
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<WireStatus>,
}

/// The provider's RPC status payload
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStatus {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A `checkUpgradability` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUpgradability {
    #[serde(default)]
    pub upgradeable: bool,
    #[serde(default)]
    pub upgrade_version: Option<String>,
    #[serde(default)]
    pub upgrade_info: Option<String>,
}

/// An error response body, `{ "error": { ... } }`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WireErrorBody {
    #[serde(default)]
    pub error: Option<WireStatus>,
}
