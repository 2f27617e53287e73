// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal scripted service for unit tests within this crate
//!
//! Integration tests use the full simulator from `fleet-test-utils`; the
//! unit tests here only need scripted responses for single calls.

use crate::service::InstanceService;
use crate::service::OperationPoll;
use crate::service::UpgradeCheck;
use async_trait::async_trait;
use fleet_common::instance::HealthState;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use fleet_common::instance::OperationHandle;
use fleet_common::Error;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Default)]
struct StubState {
    polls: VecDeque<Result<OperationPoll, Error>>,
    gets: VecDeque<Result<InstanceSnapshot, Error>>,
    polls_taken: usize,
    gets_taken: usize,
}

/// Scripted responses for `get_operation` and `get_instance`; the other
/// methods are not exercised by unit tests and panic if called.
#[derive(Clone, Default)]
pub struct StubService {
    state: Arc<Mutex<StubState>>,
}

impl StubService {
    pub fn push_poll(&self, poll: Result<OperationPoll, Error>) {
        self.state.lock().unwrap().polls.push_back(poll);
    }

    pub fn push_get(&self, get: Result<InstanceSnapshot, Error>) {
        self.state.lock().unwrap().gets.push_back(get);
    }

    pub fn polls_taken(&self) -> usize {
        self.state.lock().unwrap().polls_taken
    }

    pub fn gets_taken(&self) -> usize {
        self.state.lock().unwrap().gets_taken
    }
}

#[async_trait]
impl InstanceService for StubService {
    async fn list_instances(
        &self,
        _project: &str,
        _location: &str,
    ) -> Result<Vec<InstanceSnapshot>, Error> {
        panic!("list_instances not scripted in StubService");
    }

    async fn get_instance(
        &self,
        _name: &str,
    ) -> Result<InstanceSnapshot, Error> {
        let mut state = self.state.lock().unwrap();
        state.gets_taken += 1;
        state.gets.pop_front().expect("unscripted get_instance call")
    }

    async fn start_instance(
        &self,
        _name: &str,
    ) -> Result<OperationHandle, Error> {
        panic!("start_instance not scripted in StubService");
    }

    async fn begin_upgrade(
        &self,
        _name: &str,
    ) -> Result<OperationHandle, Error> {
        panic!("begin_upgrade not scripted in StubService");
    }

    async fn begin_rollback(
        &self,
        _name: &str,
    ) -> Result<OperationHandle, Error> {
        panic!("begin_rollback not scripted in StubService");
    }

    async fn get_operation(
        &self,
        _handle: &OperationHandle,
    ) -> Result<OperationPoll, Error> {
        let mut state = self.state.lock().unwrap();
        state.polls_taken += 1;
        state.polls.pop_front().expect("unscripted get_operation call")
    }

    async fn check_upgradable(
        &self,
        _name: &str,
    ) -> Result<UpgradeCheck, Error> {
        panic!("check_upgradable not scripted in StubService");
    }
}

/// Build a snapshot with the given lifecycle and health states.
pub fn snapshot(
    short_name: &str,
    location: &str,
    state: InstanceState,
    health: HealthState,
) -> InstanceSnapshot {
    InstanceSnapshot {
        name: format!(
            "projects/test/locations/{location}/instances/{short_name}"
        ),
        short_name: short_name.to_string(),
        location: location.to_string(),
        state,
        raw_state: None,
        health_state: health,
        current_version: "1.0.0".to_string(),
        available_upgrade_version: None,
        previous_version: None,
        last_upgrade_at: None,
        rollback_window_expires_at: None,
        labels: BTreeMap::new(),
    }
}
