// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability surface the engine needs from the cloud provider
//!
//! Implementations hide wire encoding, authentication and path
//! construction; the engine sees only these seven operations.  An
//! implementation must be safe to call concurrently from many workers and
//! must keep no session state that concurrent use could corrupt.  It
//! performs no retries of its own: retry policy lives in the operation
//! tracker.

use async_trait::async_trait;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::OperationHandle;
use fleet_common::Error;

/// One observation of a long-running operation
#[derive(Clone, Debug, PartialEq)]
pub struct OperationPoll {
    pub done: bool,
    /// Set only when `done` is true and the operation failed.
    pub error: Option<Error>,
}

impl OperationPoll {
    pub fn pending() -> OperationPoll {
        OperationPoll { done: false, error: None }
    }

    pub fn succeeded() -> OperationPoll {
        OperationPoll { done: true, error: None }
    }

    pub fn failed(error: Error) -> OperationPoll {
        OperationPoll { done: true, error: Some(error) }
    }
}

/// Result of a read-only upgradability check
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradeCheck {
    pub upgradable: bool,
    pub target_version: Option<String>,
}

/// Provider operations used by the engine
#[async_trait]
pub trait InstanceService: Send + Sync {
    /// List the instances in one location, in stable order by resource
    /// name.
    async fn list_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<InstanceSnapshot>, Error>;

    /// Fetch a fresh snapshot of one instance.
    async fn get_instance(&self, name: &str)
        -> Result<InstanceSnapshot, Error>;

    /// Begin starting a stopped or suspended instance.  Fails with
    /// `PRECONDITION_VIOLATED` in any other state.
    async fn start_instance(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error>;

    /// Begin upgrading an active instance with an available upgrade.
    async fn begin_upgrade(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error>;

    /// Begin rolling an active instance back to its previous version.
    async fn begin_rollback(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error>;

    /// Observe a long-running operation.  Idempotent.
    async fn get_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationPoll, Error>;

    /// Check whether an upgrade is available for the instance.  Read-only.
    async fn check_upgradable(
        &self,
        name: &str,
    ) -> Result<UpgradeCheck, Error>;
}
