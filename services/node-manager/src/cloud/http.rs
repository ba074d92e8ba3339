//! REST provider driver.
//!
//! Speaks a small instance API:
//!
//! ```text
//! GET    /v1/instances         -> {"instances": [{id, state, tags}]}
//! POST   /v1/instances         <- {instance_type, tags, client_token}
//!                              -> {"id": "..."}
//! DELETE /v1/instances/{id}    -> 2xx, or 404 when absent
//! ```
//!
//! `client_token` is the requesting node id, so a retried create after a lost
//! response returns the same instance instead of a second one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CloudDriver, CloudError, CloudInstance, InstanceId, TAG_NODE_ID};
use crate::size::NodeSize;

/// HTTP cloud driver.
pub struct HttpCloud {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    instances: Vec<CloudInstance>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    instance_type: &'a str,
    tags: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: InstanceId,
}

impl HttpCloud {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Map a non-success response to a cloud error.
    async fn error_from(response: Response) -> CloudError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        classify(status, retry_after, body)
    }
}

fn classify(status: StatusCode, retry_after: Option<Duration>, body: String) -> CloudError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CloudError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => CloudError::Transient(format!("{status}: {body}")),
        s if s.is_server_error() => CloudError::Transient(format!("{status}: {body}")),
        _ => CloudError::Terminal(format!("{status}: {body}")),
    }
}

fn transport_error(e: reqwest::Error) -> CloudError {
    if e.is_builder() {
        CloudError::Terminal(e.to_string())
    } else {
        // Timeouts, connection resets and undecodable bodies are all worth
        // another attempt.
        CloudError::Transient(e.to_string())
    }
}

#[async_trait]
impl CloudDriver for HttpCloud {
    fn name(&self) -> &str {
        "http"
    }

    async fn list(&self) -> Result<Vec<CloudInstance>, CloudError> {
        let response = self
            .request(reqwest::Method::GET, "/v1/instances")
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: ListResponse = response.json().await.map_err(transport_error)?;
        debug!(count = body.instances.len(), "listed cloud instances");
        Ok(body.instances)
    }

    async fn create(
        &self,
        size: &NodeSize,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceId, CloudError> {
        let request = CreateRequest {
            instance_type: size.provider_type(),
            tags,
            client_token: tags.get(TAG_NODE_ID).map(String::as_str),
        };

        let response = self
            .request(reqwest::Method::POST, "/v1/instances")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: CreateResponse = response.json().await.map_err(transport_error)?;
        debug!(instance_id = %body.id, size = %size.name, "created cloud instance");
        Ok(body.id)
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), CloudError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/instances/{id}"))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(id.clone())),
            s if s.is_success() => Ok(()),
            _ => Err(Self::error_from(response).await),
        }
    }
}
