//! HTTP control-plane client.
//!
//! Talks JSON to `{endpoint}/resources/{type}[/{id}]`. Status codes are
//! mapped onto the provider error taxonomy; retrying is left to the executor.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Properties;
use crate::error::{ConvergeError, ProviderError, Result};
use crate::resource::ResourceType;

use super::api::{ObservedResource, Provider, ProvisionedResource, ResourceRequest};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    name: &'a str,
    properties: &'a Properties,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    properties: &'a Properties,
}

impl HttpProvider {
    /// Creates a client with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConvergeError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self, resource_type: ResourceType) -> String {
        format!("{}/resources/{}", self.endpoint, resource_type)
    }

    fn item_url(&self, resource_type: ResourceType, physical_id: &str) -> String {
        format!("{}/{physical_id}", self.collection_url(resource_type))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, name: &str, request: reqwest::RequestBuilder) -> Result<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::transient(name, format!("Request failed: {e}")).into())
    }

    async fn decode<T: for<'de> serde::Deserialize<'de>>(name: &str, response: Response) -> Result<T> {
        response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                resource: name.to_string(),
                message: format!("Failed to parse response: {e}"),
            }
            .into()
        })
    }
}

/// Maps a non-success response onto a provider error.
async fn classify(name: &str, physical_id: Option<&str>, response: Response) -> ConvergeError {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        return ProviderError::RateLimited {
            resource: name.to_string(),
            retry_after_secs,
        }
        .into();
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ProviderError::AuthenticationFailed {
            message: format!("{status} while handling '{name}'"),
        }
        .into();
    }

    if status == StatusCode::NOT_FOUND {
        if let Some(physical_id) = physical_id {
            return ProviderError::NotFound {
                resource: name.to_string(),
                physical_id: physical_id.to_string(),
            }
            .into();
        }
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() { status.to_string() } else { format!("{status}: {body}") };

    if is_transient_status(status) {
        ProviderError::transient(name, message).into()
    } else {
        ProviderError::Permanent {
            resource: name.to_string(),
            message,
            status: Some(status.as_u16()),
        }
        .into()
    }
}

/// Conflict and gateway statuses signal eventual-consistency lag.
fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::CONFLICT | StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        let url = self.collection_url(request.resource_type);
        debug!("POST {url} ({})", request.name);

        let body = CreateBody {
            name: &request.name,
            properties: &request.properties,
        };
        let response = self.send(&request.name, self.client.post(&url).json(&body)).await?;

        if !response.status().is_success() {
            return Err(classify(&request.name, None, response).await);
        }
        Self::decode(&request.name, response).await
    }

    async fn read(&self, resource_type: ResourceType, name: &str, physical_id: &str) -> Result<Option<ObservedResource>> {
        let url = self.item_url(resource_type, physical_id);
        trace!("GET {url}");

        let response = self.send(name, self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify(name, Some(physical_id), response).await);
        }
        Self::decode(name, response).await.map(Some)
    }

    async fn update(&self, physical_id: &str, request: &ResourceRequest) -> Result<ProvisionedResource> {
        let url = self.item_url(request.resource_type, physical_id);
        debug!("PUT {url} ({})", request.name);

        let body = UpdateBody {
            properties: &request.properties,
        };
        let response = self.send(&request.name, self.client.put(&url).json(&body)).await?;

        if !response.status().is_success() {
            return Err(classify(&request.name, Some(physical_id), response).await);
        }
        Self::decode(&request.name, response).await
    }

    async fn delete(&self, resource_type: ResourceType, name: &str, physical_id: &str) -> Result<()> {
        let url = self.item_url(resource_type, physical_id);
        debug!("DELETE {url} ({name})");

        let response = self.send(name, self.client.delete(&url)).await?;

        if !response.status().is_success() {
            return Err(classify(name, Some(physical_id), response).await);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}
