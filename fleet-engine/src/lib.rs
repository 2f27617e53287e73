// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet lifecycle engine for managed notebook compute instances
//!
//! The engine drives one lifecycle transition (upgrade, or rollback to the
//! previously captured version) across a fleet: discovery across locations,
//! pre-condition normalisation, bounded concurrent execution, long-running
//! operation tracking, post-condition health verification, optional
//! compensating rollback, and structured reporting.
//!
//! The engine is a library core.  Consumers call [`run`] with a validated
//! configuration, an [`InstanceService`] implementation, a [`Clock`], a
//! logger and a cancellation signal, and get back a [`FleetReport`];
//! writing the report artefacts is the job of the [`report`] module.

pub mod clock;
pub mod eligibility;
pub mod executor;
pub mod health;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod tracker;

#[cfg(test)]
mod testutil;

pub use clock::CancelSignal;
pub use clock::Clock;
pub use clock::SystemClock;
pub use fleet_common::config::OperationKind;
pub use fleet_common::config::RunConfig;
pub use fleet_common::report::FleetReport;
pub use scheduler::run;
pub use service::InstanceService;
pub use service::OperationPoll;
pub use service::UpgradeCheck;
