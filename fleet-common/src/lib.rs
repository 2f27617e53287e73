// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the fleet lifecycle engine and its consumers
//!
//! This crate holds the value types that cross component boundaries: the
//! run configuration, the immutable instance snapshot taken at discovery,
//! per-instance operation results, the fleet report, the closed error
//! taxonomy, and the retry policies used when talking to the provider.

pub mod backoff;
pub mod config;
pub mod error;
pub mod instance;
pub mod report;

pub use error::Error;
pub use error::ErrorKind;
