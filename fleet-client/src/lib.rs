// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP adapter for the provider's managed-notebooks REST API
//!
//! Implements the engine's `InstanceService` capability surface: path
//! construction, bearer authentication, wire decoding, and the mapping
//! from HTTP statuses to the engine's error taxonomy.  No policy lives
//! here, and no retrying: transient failures are surfaced as-is for the
//! engine's operation tracker to handle.

mod wire;

pub mod token;

use async_trait::async_trait;
use fleet_common::instance::InstanceSnapshot;
use fleet_common::instance::OperationHandle;
use fleet_common::Error;
use fleet_engine::service::InstanceService;
use fleet_engine::service::OperationPoll;
use fleet_engine::service::UpgradeCheck;
use slog::debug;
use slog::Logger;
use std::sync::Arc;
use token::TokenSource;
use wire::WireErrorBody;
use wire::WireInstance;
use wire::WireInstanceList;
use wire::WireOperation;
use wire::WireStatus;
use wire::WireUpgradability;

/// Default API frontend for the managed-notebooks service.
pub const DEFAULT_BASE_URL: &str = "https://notebooks.googleapis.com/v2";

/// `InstanceService` implementation over the provider's REST API
pub struct HttpInstanceService {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    log: Logger,
}

impl HttpInstanceService {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        tokens: Arc<dyn TokenSource>,
        log: Logger,
    ) -> HttpInstanceService {
        HttpInstanceService {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            log,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let token = self.tokens.token().await?;
        debug!(self.log, "provider request"; "method" => "GET", "url" => url);
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, Error> {
        let token = self.tokens.token().await?;
        debug!(self.log, "provider request"; "method" => "POST", "url" => url);
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(response).await
    }

    async fn begin(&self, name: &str, verb: &str) -> Result<OperationHandle, Error> {
        let operation: WireOperation = self
            .post_json(
                &self.url(&format!("{name}:{verb}")),
                &serde_json::json!({}),
            )
            .await?;
        Ok(OperationHandle::from(operation.name))
    }
}

#[async_trait]
impl InstanceService for HttpInstanceService {
    async fn list_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<InstanceSnapshot>, Error> {
        let parent = format!("projects/{project}/locations/{location}");
        let url = self.url(&format!("{parent}/instances"));

        let mut snapshots = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query: Vec<(&str, &str)> = match &page_token {
                Some(token) => vec![("pageToken", token.as_str())],
                None => Vec::new(),
            };
            let page: WireInstanceList =
                self.get_json(&url, &query).await?;
            snapshots.extend(
                page.instances
                    .into_iter()
                    .map(|instance| instance.into_snapshot(location)),
            );
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        // The provider lists in name order per page; keep the whole
        // result stable regardless.
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    async fn get_instance(
        &self,
        name: &str,
    ) -> Result<InstanceSnapshot, Error> {
        let instance: WireInstance =
            self.get_json(&self.url(name), &[]).await?;
        let location = location_of(name).to_string();
        Ok(instance.into_snapshot(&location))
    }

    async fn start_instance(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        self.begin(name, "start").await
    }

    async fn begin_upgrade(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        self.begin(name, "upgrade").await
    }

    async fn begin_rollback(
        &self,
        name: &str,
    ) -> Result<OperationHandle, Error> {
        self.begin(name, "rollback").await
    }

    async fn get_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationPoll, Error> {
        let operation: WireOperation =
            self.get_json(&self.url(&handle.0), &[]).await?;
        Ok(OperationPoll {
            done: operation.done,
            error: operation.error.map(|status| operation_error(&status)),
        })
    }

    async fn check_upgradable(
        &self,
        name: &str,
    ) -> Result<UpgradeCheck, Error> {
        let check: WireUpgradability = self
            .get_json(&self.url(&format!("{name}:checkUpgradability")), &[])
            .await?;
        Ok(UpgradeCheck {
            upgradable: check.upgradeable,
            target_version: check.upgrade_version.or(check.upgrade_info),
        })
    }
}

/// Extract the location segment of a fully qualified instance name.
fn location_of(name: &str) -> &str {
    let mut segments = name.split('/');
    while let Some(segment) = segments.next() {
        if segment == "locations" {
            return segments.next().unwrap_or("");
        }
    }
    ""
}

fn transport_error(error: reqwest::Error) -> Error {
    Error::transient(format!("transport error: {error}"))
}

/// Decode a response body, mapping non-success statuses onto the engine's
/// error taxonomy.
async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Error> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|error| {
            Error::unexpected(format!("malformed provider response: {error}"))
        });
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<WireErrorBody>(&body)
        .ok()
        .and_then(|body| body.error)
        .unwrap_or_default();
    Err(status_error(status, &detail, &body))
}

/// Map an HTTP error status (and its decoded detail, if any) onto the
/// engine's taxonomy.
fn status_error(
    status: http::StatusCode,
    detail: &WireStatus,
    raw_body: &str,
) -> Error {
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| truncate(raw_body, 200));
    let message = format!("HTTP {}: {}", status.as_u16(), message);
    match status {
        http::StatusCode::UNAUTHORIZED | http::StatusCode::FORBIDDEN => {
            Error::auth_failed(message)
        }
        http::StatusCode::NOT_FOUND => Error::not_found(message),
        // A 409 carrying an explicit state-conflict status means another
        // controller changed the instance under us.  A plain 409 is the
        // provider's operation queue pushing back and must stay
        // retryable, like 429.
        http::StatusCode::CONFLICT => match detail.status.as_deref() {
            Some("ABORTED")
            | Some("FAILED_PRECONDITION")
            | Some("ALREADY_EXISTS") => Error::precondition_violated(message),
            _ => Error::rate_limited(message),
        },
        http::StatusCode::TOO_MANY_REQUESTS => Error::rate_limited(message),
        http::StatusCode::BAD_REQUEST
            if detail.status.as_deref() == Some("FAILED_PRECONDITION") =>
        {
            Error::precondition_violated(message)
        }
        status if status.is_server_error() => Error::transient(message),
        _ => Error::unexpected(message),
    }
}

/// Map a failed operation's RPC status onto the engine's taxonomy.
fn operation_error(status: &WireStatus) -> Error {
    let message = status
        .message
        .clone()
        .unwrap_or_else(|| "operation failed".to_string());
    // gRPC canonical codes.
    match status.code {
        Some(5) => Error::not_found(message),
        Some(7) | Some(16) => Error::auth_failed(message),
        Some(8) => Error::rate_limited(message),
        Some(9) => Error::precondition_violated(message),
        Some(14) => Error::transient(message),
        _ => Error::unexpected(message),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(index, _)| *index < limit)
            .last()
            .map(|(index, _)| index)
            .unwrap_or(0);
        format!("{}...", &text[..cut])
    }
}
