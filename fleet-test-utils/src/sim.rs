// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted in-memory provider
//!
//! `SimFleet` implements the engine's `InstanceService` against an
//! in-memory fleet whose behaviour is scripted per instance: how many
//! polls an operation takes to resolve, whether it resolves with an
//! error, and which calls fail with injected provider errors.  Every call
//! is recorded with its (virtual) timestamp so tests can assert on purity,
//! ordering and pacing.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use fleet_common::instance::HealthState;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::InstanceState;
use fleet_common::instance::OperationHandle;
use fleet_common::Error;
use fleet_engine::service::InstanceService;
use fleet_engine::service::OperationPoll;
use fleet_engine::service::UpgradeCheck;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::Instant;

pub const METHOD_LIST: &str = "list_instances";
pub const METHOD_GET: &str = "get_instance";
pub const METHOD_START: &str = "start_instance";
pub const METHOD_BEGIN_UPGRADE: &str = "begin_upgrade";
pub const METHOD_BEGIN_ROLLBACK: &str = "begin_rollback";
pub const METHOD_GET_OPERATION: &str = "get_operation";
pub const METHOD_CHECK_UPGRADABLE: &str = "check_upgradable";

const MUTATING_METHODS: [&str; 3] =
    [METHOD_START, METHOD_BEGIN_UPGRADE, METHOD_BEGIN_ROLLBACK];

/// One recorded provider call
#[derive(Clone, Debug)]
pub struct RecordedCall {
    /// Virtual timestamp of the call (tokio clock).
    pub at: Instant,
    pub method: &'static str,
    /// Short name of the instance the call targeted.
    pub target: String,
}

impl RecordedCall {
    pub fn is_mutation(&self) -> bool {
        MUTATING_METHODS.contains(&self.method)
    }
}

/// Scripted description of one simulated instance
#[derive(Clone, Debug)]
pub struct SimInstance {
    short_name: String,
    location: String,
    state: InstanceState,
    raw_state: Option<String>,
    health: HealthState,
    current_version: String,
    upgrade_target: Option<String>,
    previous_version: Option<String>,
    last_upgrade_at: Option<DateTime<Utc>>,
    rollback_window_expires_at: Option<DateTime<Utc>>,
    labels: BTreeMap<String, String>,
    /// How many `get_operation` polls any operation on this instance
    /// takes to resolve.
    polls_to_complete: u32,
    fail_start: Option<Error>,
    fail_upgrade: Option<Error>,
    fail_rollback: Option<Error>,
}

impl SimInstance {
    pub fn new(short_name: &str, location: &str) -> SimInstance {
        SimInstance {
            short_name: short_name.to_string(),
            location: location.to_string(),
            state: InstanceState::Active,
            raw_state: None,
            health: HealthState::Healthy,
            current_version: "2.0.0".to_string(),
            upgrade_target: None,
            previous_version: None,
            last_upgrade_at: None,
            rollback_window_expires_at: None,
            labels: BTreeMap::new(),
            polls_to_complete: 1,
            fail_start: None,
            fail_upgrade: None,
            fail_rollback: None,
        }
    }

    pub fn state(mut self, state: InstanceState) -> SimInstance {
        self.state = state;
        self
    }

    /// Present the instance with a state string outside the schema.
    pub fn unrecognised_state(mut self, raw: &str) -> SimInstance {
        self.state = InstanceState::Unknown;
        self.raw_state = Some(raw.to_string());
        self
    }

    pub fn health(mut self, health: HealthState) -> SimInstance {
        self.health = health;
        self
    }

    pub fn version(mut self, version: &str) -> SimInstance {
        self.current_version = version.to_string();
        self
    }

    /// Make an upgrade to `target` available.
    pub fn upgrade_available(mut self, target: &str) -> SimInstance {
        self.upgrade_target = Some(target.to_string());
        self
    }

    pub fn previous_version(mut self, version: &str) -> SimInstance {
        self.previous_version = Some(version.to_string());
        self
    }

    pub fn last_upgrade_at(mut self, at: DateTime<Utc>) -> SimInstance {
        self.last_upgrade_at = Some(at);
        self
    }

    pub fn rollback_window_expires_at(
        mut self,
        at: DateTime<Utc>,
    ) -> SimInstance {
        self.rollback_window_expires_at = Some(at);
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> SimInstance {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Operations on this instance resolve after `polls` observations.
    pub fn polls_to_complete(mut self, polls: u32) -> SimInstance {
        self.polls_to_complete = polls.max(1);
        self
    }

    /// The next start operation resolves with this error.
    pub fn fail_start_with(mut self, error: Error) -> SimInstance {
        self.fail_start = Some(error);
        self
    }

    /// The next upgrade operation resolves with this error.
    pub fn fail_upgrade_with(mut self, error: Error) -> SimInstance {
        self.fail_upgrade = Some(error);
        self
    }

    /// The next rollback operation resolves with this error.
    pub fn fail_rollback_with(mut self, error: Error) -> SimInstance {
        self.fail_rollback = Some(error);
        self
    }

    fn full_name(&self, project: &str) -> String {
        format!(
            "projects/{}/locations/{}/instances/{}",
            project, self.location, self.short_name
        )
    }

    fn snapshot(&self, project: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            name: self.full_name(project),
            short_name: self.short_name.clone(),
            location: self.location.clone(),
            state: self.state,
            raw_state: self.raw_state.clone(),
            health_state: self.health,
            current_version: self.current_version.clone(),
            available_upgrade_version: self.upgrade_target.clone(),
            previous_version: self.previous_version.clone(),
            last_upgrade_at: self.last_upgrade_at,
            rollback_window_expires_at: self.rollback_window_expires_at,
            labels: self.labels.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SimOpKind {
    Start,
    Upgrade,
    Rollback,
}

#[derive(Debug)]
struct SimOperation {
    instance: String,
    kind: SimOpKind,
    remaining_polls: u32,
    outcome: Option<Error>,
    done: bool,
}

#[derive(Default)]
struct SimState {
    instances: BTreeMap<String, SimInstance>,
    operations: BTreeMap<String, SimOperation>,
    calls: Vec<RecordedCall>,
    faults: HashMap<(&'static str, String), VecDeque<Error>>,
    next_operation: u64,
    active_operations: usize,
    max_active_operations: usize,
}

/// The scripted provider; cheap to clone and safe to share across workers
#[derive(Clone, Default)]
pub struct SimFleet {
    project: String,
    state: Arc<Mutex<SimState>>,
}

impl SimFleet {
    pub fn new(project: &str) -> SimFleet {
        SimFleet {
            project: project.to_string(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn add_instance(&self, instance: SimInstance) {
        let mut state = self.state.lock().unwrap();
        let key = instance.full_name(&self.project);
        state.instances.insert(key, instance);
    }

    /// Queue an error for the next call of `method` against the named
    /// instance; once the queue drains, calls behave normally again.
    pub fn inject_fault(
        &self,
        method: &'static str,
        short_name: &str,
        error: Error,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .faults
            .entry((method, short_name.to_string()))
            .or_default()
            .push_back(error);
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Recorded calls to provider mutations.
    pub fn mutations(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(RecordedCall::is_mutation).collect()
    }

    pub fn calls_to(&self, method: &'static str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.method == method).collect()
    }

    /// High-water mark of concurrently in-flight operations.
    pub fn max_active_operations(&self) -> usize {
        self.state.lock().unwrap().max_active_operations
    }

    /// Current snapshot of an instance, for post-run assertions.
    pub fn snapshot_of(&self, short_name: &str) -> Option<InstanceSnapshot> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .values()
            .find(|instance| instance.short_name == short_name)
            .map(|instance| instance.snapshot(&self.project))
    }

    fn record(&self, state: &mut SimState, method: &'static str, target: &str) {
        state.calls.push(RecordedCall {
            at: Instant::now(),
            method,
            target: target.to_string(),
        });
    }

    fn take_fault(
        &self,
        state: &mut SimState,
        method: &'static str,
        short_name: &str,
    ) -> Option<Error> {
        let queue =
            state.faults.get_mut(&(method, short_name.to_string()))?;
        let fault = queue.pop_front();
        if queue.is_empty() {
            state.faults.remove(&(method, short_name.to_string()));
        }
        fault
    }

    fn begin_operation(
        &self,
        state: &mut SimState,
        instance_name: &str,
        kind: SimOpKind,
    ) -> OperationHandle {
        let id = state.next_operation;
        state.next_operation += 1;
        let handle = format!("operations/sim-{id}");

        let instance = state
            .instances
            .get_mut(instance_name)
            .expect("operation begun against a known instance");
        let outcome = match kind {
            SimOpKind::Start => instance.fail_start.take(),
            SimOpKind::Upgrade => instance.fail_upgrade.take(),
            SimOpKind::Rollback => instance.fail_rollback.take(),
        };
        let remaining_polls = instance.polls_to_complete;

        state.operations.insert(
            handle.clone(),
            SimOperation {
                instance: instance_name.to_string(),
                kind,
                remaining_polls,
                outcome,
                done: false,
            },
        );
        state.active_operations += 1;
        state.max_active_operations =
            state.max_active_operations.max(state.active_operations);
        OperationHandle::from(handle)
    }

    /// Apply the server-side effect of a resolved operation.
    fn complete_operation(state: &mut SimState, handle: &str) {
        let operation = state.operations.get_mut(handle).expect("known op");
        operation.done = true;
        state.active_operations -= 1;

        let failed = operation.outcome.is_some();
        let kind = operation.kind;
        let instance_name = operation.instance.clone();
        let instance = state
            .instances
            .get_mut(&instance_name)
            .expect("operation target exists");

        if failed {
            // The provider abandons the attempt and recovers the
            // instance in place.
            instance.state = InstanceState::Active;
            return;
        }
        match kind {
            SimOpKind::Start => {
                instance.state = InstanceState::Active;
            }
            SimOpKind::Upgrade => {
                let target = instance
                    .upgrade_target
                    .take()
                    .expect("upgrade begun with a target");
                instance.previous_version =
                    Some(std::mem::replace(
                        &mut instance.current_version,
                        target,
                    ));
                instance.last_upgrade_at = Some(Utc::now());
                instance.state = InstanceState::Active;
            }
            SimOpKind::Rollback => {
                let previous = instance
                    .previous_version
                    .take()
                    .expect("rollback begun with a previous version");
                instance.current_version = previous;
                instance.last_upgrade_at = None;
                instance.state = InstanceState::Active;
            }
        }
    }

    fn short_name_of_operation(state: &SimState, handle: &str) -> String {
        state
            .operations
            .get(handle)
            .map(|operation| {
                InstanceSnapshot::short_name_of(&operation.instance)
                    .to_string()
            })
            .unwrap_or_else(|| handle.to_string())
    }
}

#[async_trait]
impl InstanceService for SimFleet {
    async fn list_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<InstanceSnapshot>, Error> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_LIST, location);
        if let Some(error) = self.take_fault(&mut state, METHOD_LIST, location)
        {
            return Err(error);
        }
        if project != self.project {
            return Err(Error::not_found(format!(
                "project {project:?} not found"
            )));
        }
        Ok(state
            .instances
            .values()
            .filter(|instance| instance.location == location)
            .map(|instance| instance.snapshot(&self.project))
            .collect())
    }

    async fn get_instance(
        &self,
        name: &str,
    ) -> Result<InstanceSnapshot, Error> {
        let short = InstanceSnapshot::short_name_of(name).to_string();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_GET, &short);
        if let Some(error) = self.take_fault(&mut state, METHOD_GET, &short) {
            return Err(error);
        }
        state
            .instances
            .get(name)
            .map(|instance| instance.snapshot(&self.project))
            .ok_or_else(|| Error::not_found(format!("no instance {name:?}")))
    }

    async fn start_instance(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        let short = InstanceSnapshot::short_name_of(name).to_string();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_START, &short);
        if let Some(error) = self.take_fault(&mut state, METHOD_START, &short)
        {
            return Err(error);
        }
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("no instance {name:?}")))?;
        if !instance.state.is_startable() {
            return Err(Error::precondition_violated(format!(
                "cannot start instance in state {}",
                instance.state
            )));
        }
        instance.state = InstanceState::Starting;
        Ok(self.begin_operation(&mut state, name, SimOpKind::Start))
    }

    async fn begin_upgrade(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        let short = InstanceSnapshot::short_name_of(name).to_string();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_BEGIN_UPGRADE, &short);
        if let Some(error) =
            self.take_fault(&mut state, METHOD_BEGIN_UPGRADE, &short)
        {
            return Err(error);
        }
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("no instance {name:?}")))?;
        if instance.state != InstanceState::Active {
            return Err(Error::precondition_violated(format!(
                "cannot upgrade instance in state {}",
                instance.state
            )));
        }
        if instance.upgrade_target.is_none() {
            return Err(Error::precondition_violated(
                "no upgrade available for instance",
            ));
        }
        instance.state = InstanceState::Upgrading;
        Ok(self.begin_operation(&mut state, name, SimOpKind::Upgrade))
    }

    async fn begin_rollback(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        let short = InstanceSnapshot::short_name_of(name).to_string();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_BEGIN_ROLLBACK, &short);
        if let Some(error) =
            self.take_fault(&mut state, METHOD_BEGIN_ROLLBACK, &short)
        {
            return Err(error);
        }
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("no instance {name:?}")))?;
        if instance.state != InstanceState::Active {
            return Err(Error::precondition_violated(format!(
                "cannot roll back instance in state {}",
                instance.state
            )));
        }
        if instance.previous_version.is_none() {
            return Err(Error::precondition_violated(
                "no previous version to roll back to",
            ));
        }
        instance.state = InstanceState::Upgrading;
        Ok(self.begin_operation(&mut state, name, SimOpKind::Rollback))
    }

    async fn get_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationPoll, Error> {
        let mut state = self.state.lock().unwrap();
        let short = SimFleet::short_name_of_operation(&state, &handle.0);
        self.record(&mut state, METHOD_GET_OPERATION, &short);
        if let Some(error) =
            self.take_fault(&mut state, METHOD_GET_OPERATION, &short)
        {
            return Err(error);
        }
        let resolve = {
            let operation =
                state.operations.get_mut(&handle.0).ok_or_else(|| {
                    Error::not_found(format!("no operation {:?}", handle.0))
                })?;
            if operation.done {
                false
            } else if operation.remaining_polls > 1 {
                operation.remaining_polls -= 1;
                return Ok(OperationPoll::pending());
            } else {
                true
            }
        };
        if resolve {
            SimFleet::complete_operation(&mut state, &handle.0);
        }
        let operation = &state.operations[&handle.0];
        Ok(match &operation.outcome {
            None => OperationPoll::succeeded(),
            Some(error) => OperationPoll::failed(error.clone()),
        })
    }

    async fn check_upgradable(
        &self,
        name: &str,
    ) -> Result<UpgradeCheck, Error> {
        let short = InstanceSnapshot::short_name_of(name).to_string();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, METHOD_CHECK_UPGRADABLE, &short);
        if let Some(error) =
            self.take_fault(&mut state, METHOD_CHECK_UPGRADABLE, &short)
        {
            return Err(error);
        }
        let instance = state
            .instances
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no instance {name:?}")))?;
        Ok(UpgradeCheck {
            upgradable: instance.upgrade_target.is_some(),
            target_version: instance.upgrade_target.clone(),
        })
    }
}
