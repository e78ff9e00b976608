//! Sync API Client - transport to the remote data backend
//!
//! The engine only talks to the backend through `RemoteBackend`:
//! - perform a queued create/update/delete
//! - fetch entities changed since a watermark
//! - register this device
//!
//! `HttpBackend` implements it over a REST API; tests substitute scripted
//! doubles.

use super::models::{DeviceRecord, OperationKind, RemoteEntity, SyncOperation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote data backend used by the engine
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Deliver one queued operation
    async fn perform_operation(&self, operation: &SyncOperation) -> Result<(), SyncApiError>;

    /// Entities of `entity_type` changed after `since` (everything when `None`)
    async fn fetch_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEntity>, SyncApiError>;

    /// Announce this device to the backend
    async fn register_device(&self, device: &DeviceRecord) -> Result<(), SyncApiError>;
}

// ============================================================================
// HTTP Backend
// ============================================================================

/// REST client for the sync server
pub struct HttpBackend {
    client: Client,
    base_url: url::Url,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpBackend {
    /// Create new API client
    pub fn new(base_url: &str) -> Result<Self, SyncApiError> {
        // A trailing slash makes `join` append instead of replacing the last segment
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = url::Url::parse(&normalized)
            .map_err(|e| SyncApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token
    pub async fn set_token(&self, token: String) {
        *self.access_token.write().await = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token
    pub async fn clear_token(&self) {
        *self.access_token.write().await = None;
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, SyncApiError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncApiError::InvalidUrl(format!("{}: {}", path, e)))
    }

    async fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.get_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn perform_operation(&self, operation: &SyncOperation) -> Result<(), SyncApiError> {
        let entity_type = urlencode(&operation.entity_type);
        let entity_id = urlencode(&operation.entity_id);

        let request = match operation.kind {
            OperationKind::Create => self
                .client
                .post(self.endpoint(&format!("sync/{}", entity_type))?)
                .json(&operation.local_payload),
            OperationKind::Update => self
                .client
                .put(self.endpoint(&format!("sync/{}/{}", entity_type, entity_id))?)
                .json(&operation.local_payload),
            OperationKind::Delete => self
                .client
                .delete(self.endpoint(&format!("sync/{}/{}", entity_type, entity_id))?),
        };

        let response = self
            .authorized(request.header("X-Operation-Id", operation.id.as_str()))
            .await
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn fetch_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEntity>, SyncApiError> {
        let mut url = self.endpoint(&format!("sync/{}", urlencode(entity_type)))?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", &since.to_rfc3339());
        }

        let response = self.authorized(self.client.get(url)).await.send().await?;

        // Handle 404 as empty data (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        handle_response(response).await
    }

    async fn register_device(&self, device: &DeviceRecord) -> Result<(), SyncApiError> {
        let response = self
            .authorized(self.client.post(self.endpoint("devices")?).json(device))
            .await
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

fn urlencode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Remote version conflicts with local change")]
    Conflict { remote: Value },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    remote: Value,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncApiError::Unauthorized,
        StatusCode::CONFLICT => match response.json::<ConflictBody>().await {
            Ok(body) => SyncApiError::Conflict { remote: body.remote },
            Err(_) => SyncApiError::InvalidResponse,
        },
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(msg)
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
