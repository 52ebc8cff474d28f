//! HTTP driver
//!
//! Forwards each action to a provisioning service as
//! `POST {endpoint}/{kind}/{action}` with the record in the body and maps the
//! response status onto an [`Outcome`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Driver, Outcome};
use crate::error::{Error, Result};
use crate::resource::{Action, DesiredState, Phase, ResourceKind, ResourceRecord};

/// Longest response excerpt carried into a record's message
const MAX_REASON_LEN: usize = 512;

/// Body sent to the provisioning service
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRequest<'a> {
    pub id: &'a str,
    pub kind: ResourceKind,
    pub owner_key: &'a str,
    pub action: Action,
    pub desired_state: DesiredState,
    pub phase: Phase,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl<'a> DriverRequest<'a> {
    pub fn new(record: &'a ResourceRecord, action: Action) -> Self {
        Self {
            id: &record.id,
            kind: record.kind,
            owner_key: &record.owner_key,
            action,
            desired_state: record.desired_state,
            phase: record.phase,
            attempts: record.attempts,
            expires_at: record.expires_at,
        }
    }
}

/// Driver that delegates to an HTTP provisioning service
#[derive(Clone, Debug)]
pub struct WebhookDriver {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookDriver {
    /// `timeout` bounds each call and should be shorter than the lease
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::config(format!(
                "Driver endpoint '{endpoint}' must be an http(s) URL"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn url_for(&self, kind: ResourceKind, action: Action) -> String {
        format!("{}/{}/{}", self.endpoint, kind.slug(), action)
    }
}

#[async_trait]
impl Driver for WebhookDriver {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn apply(&self, record: &ResourceRecord, action: Action) -> Outcome {
        let url = self.url_for(record.kind, action);
        debug!(url = %url, id = %record.id, "Calling provisioning webhook");

        let response = match self
            .client
            .post(&url)
            .json(&DriverRequest::new(record, action))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Provisioning webhook unreachable");
                return Outcome::retryable(format!("{action} request failed: {e}"));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Success;
        }
        let body = response.text().await.unwrap_or_default();
        classify_failure(status, &body)
    }
}

/// Map a non-success response onto retryable or fatal
pub fn classify_failure(status: StatusCode, body: &str) -> Outcome {
    let reason = failure_reason(status, body);
    match status.as_u16() {
        // timeouts and throttling
        408 | 425 | 429 => Outcome::Retryable(reason),
        _ if status.is_server_error() => Outcome::Retryable(reason),
        _ => Outcome::Fatal(reason),
    }
}

fn failure_reason(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("driver responded {status}");
    }
    let excerpt: String = body.chars().take(MAX_REASON_LEN).collect();
    format!("driver responded {status}: {excerpt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(
                matches!(classify_failure(status, ""), Outcome::Retryable(_)),
                "{status} should be retryable"
            );
        }
    }

    #[test]
    fn client_errors_are_fatal_and_carry_the_body() {
        let outcome = classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "  quota exceeded \n");
        assert_eq!(
            outcome,
            Outcome::Fatal("driver responded 422 Unprocessable Entity: quota exceeded".to_string())
        );
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_REASON_LEN * 2);
        let Outcome::Fatal(reason) = classify_failure(StatusCode::BAD_REQUEST, &body) else {
            panic!("expected fatal outcome");
        };
        assert!(reason.len() < MAX_REASON_LEN + 64);
    }

    #[test]
    fn url_uses_kind_slug_and_action() {
        let driver = WebhookDriver::new("http://provisioner:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            driver.url_for(ResourceKind::RuntimeDomain, Action::BeginTeardown),
            "http://provisioner:8080/runtime-domain/begin-teardown"
        );
    }

    #[test]
    fn endpoint_must_be_http() {
        assert!(WebhookDriver::new("provisioner:8080", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn request_body_is_camel_case() {
        let record = ResourceRecord::new(ResourceKind::StorageBucket, "bkt-1", "app-1", Utc::now());
        let json = serde_json::to_value(DriverRequest::new(&record, Action::Provision)).unwrap();
        assert_eq!(json["ownerKey"], "app-1");
        assert_eq!(json["action"], "provision");
        assert_eq!(json["kind"], "StorageBucket");
        assert_eq!(json["desiredState"], "Active");
    }
}
