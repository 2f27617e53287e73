// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the fleet lifecycle engine
//!
//! The engine distinguishes a closed set of error kinds.  Components never
//! unwind past the per-instance executor: every error is eventually folded
//! into an `OperationResult`, carrying the kind and a sanitised message.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// An error generated while driving fleet operations
///
/// Where possible we reuse existing variants rather than inventing new ones
/// to distinguish cases that no programmatic consumer needs to distinguish.
/// The variant determines how the engine treats the failure: whether the
/// tracker retries it, whether the instance is skipped rather than failed,
/// and whether the whole run stops admitting new work.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// The run configuration failed validation.  Returned before any I/O.
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// The provider rejected our credentials.  Fatal for the run: it will
    /// recur for every instance.
    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    /// An instance or operation was not found.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// The provider refused the request because of the current instance
    /// state, most likely because another controller raced us.
    #[error("precondition violated: {message}")]
    PreconditionViolated { message: String },

    /// The provider signalled throttling.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// A network or 5xx-class transport failure.
    #[error("transient provider error: {message}")]
    Transient { message: String },

    /// The wall-clock budget for the operation was exhausted.
    #[error("timed out after {:?}", .elapsed)]
    Timeout { elapsed: Duration },

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Anything else, including schema surprises from the provider.
    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

/// The kind of an [`Error`], as recorded in operation results and reports
#[derive(
    Clone,
    Copy,
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
pub enum ErrorKind {
    ConfigInvalid,
    AuthFailed,
    NotFound,
    PreconditionViolated,
    RateLimited,
    Transient,
    Timeout,
    Cancelled,
    Unexpected,
    /// Not produced by [`Error`] itself: recorded when an instance was
    /// skipped because it was in a transient state we do not wait out.
    Busy,
    /// Not produced by [`Error`] itself: recorded when an instance failed
    /// admission or a rollback eligibility preflight.
    Ineligible,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::AuthFailed { .. } => ErrorKind::AuthFailed,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PreconditionViolated { .. } => {
                ErrorKind::PreconditionViolated
            }
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }

    /// Returns whether the error is likely transient and could reasonably
    /// be retried by the operation tracker
    pub fn retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::Transient { .. } => true,

            Error::ConfigInvalid { .. }
            | Error::AuthFailed { .. }
            | Error::NotFound { .. }
            | Error::PreconditionViolated { .. }
            | Error::Timeout { .. }
            | Error::Cancelled
            | Error::Unexpected { .. } => false,
        }
    }

    pub fn config_invalid<S: Into<String>>(message: S) -> Error {
        Error::ConfigInvalid { message: message.into() }
    }

    pub fn auth_failed<S: Into<String>>(message: S) -> Error {
        Error::AuthFailed { message: message.into() }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Error {
        Error::NotFound { message: message.into() }
    }

    pub fn precondition_violated<S: Into<String>>(message: S) -> Error {
        Error::PreconditionViolated { message: message.into() }
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Error {
        Error::RateLimited { message: message.into() }
    }

    pub fn transient<S: Into<String>>(message: S) -> Error {
        Error::Transient { message: message.into() }
    }

    pub fn timeout(elapsed: Duration) -> Error {
        Error::Timeout { elapsed }
    }

    /// Generates an [`Error::Unexpected`] with the given message
    ///
    /// This should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g. a
    /// provider response that does not match its own schema).
    pub fn unexpected<S: Into<String>>(message: S) -> Error {
        Error::Unexpected { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_partitions_kinds() {
        assert!(Error::rate_limited("429").retryable());
        assert!(Error::transient("connection reset").retryable());

        assert!(!Error::config_invalid("bad").retryable());
        assert!(!Error::auth_failed("denied").retryable());
        assert!(!Error::not_found("gone").retryable());
        assert!(!Error::precondition_violated("busy").retryable());
        assert!(!Error::timeout(Duration::from_secs(1)).retryable());
        assert!(!Error::Cancelled.retryable());
        assert!(!Error::unexpected("?").retryable());
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::PreconditionViolated).unwrap(),
            "\"PRECONDITION_VIOLATED\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::Busy).unwrap(),
            "\"BUSY\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::AuthFailed).unwrap(),
            "\"AUTH_FAILED\""
        );
    }
}
