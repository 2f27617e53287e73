// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bearer token acquisition
//!
//! The adapter authenticates every request with a bearer token.  Where
//! that token comes from (a metadata server, a credentials helper, an
//! operator-supplied value) is the consumer's concern; the adapter only
//! needs something that yields a current token on demand.

use async_trait::async_trait;
use fleet_common::Error;

/// Source of bearer tokens for provider requests
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a token valid for at least the next request.
    async fn token(&self) -> Result<String, Error>;
}

/// A fixed token, for short-lived invocations and tests
#[derive(Clone, Debug)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new<S: Into<String>>(token: S) -> StaticTokenSource {
        StaticTokenSource { token: token.into() }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String, Error> {
        Ok(self.token.clone())
    }
}
