//! Remote Sync Endpoint - transmission of queued mutations
//!
//! The worker only depends on `RemoteSyncEndpoint`; `HttpSyncEndpoint` is the
//! shipped implementation that talks JSON over HTTP:
//! - POST {base}/records/{id} with the record and its base version
//! - 200/201: accepted, body is the stored remote record
//! - 409: conflict, body carries the current remote record
//! - other 4xx: rejected, never retried
//! - 408/429/5xx and network failures: transient

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::Record;

/// Result of pushing one mutation
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Remote stored the mutation; carries the version it stored
    Accepted(Record),
    /// Remote holds a newer version than the mutation's base
    Conflict(Record),
    /// Remote refused the mutation as invalid
    Rejected(String),
}

/// Capability to transmit a record mutation to the remote authority
#[async_trait]
pub trait RemoteSyncEndpoint: Send + Sync {
    async fn push(&self, record: &Record, base_version: u64) -> Result<PushOutcome, TransportError>;
}

/// JSON-over-HTTP endpoint
pub struct HttpSyncEndpoint {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpSyncEndpoint {
    /// Create new endpoint client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(base_url).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("clinisync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Attach an opaque bearer token to every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn record_url(&self, id: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("records")
            .push(id);
        Ok(url)
    }
}

#[async_trait]
impl RemoteSyncEndpoint for HttpSyncEndpoint {
    async fn push(&self, record: &Record, base_version: u64) -> Result<PushOutcome, TransportError> {
        let body = PushRequest {
            record,
            base_version,
        };

        let mut request = self.client.post(self.record_url(&record.id)?).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        handle_push_response(response).await
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    record: &'a Record,
    base_version: u64,
}

/// 409 body: either `{ "remote": Record }` or a bare record
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConflictBody {
    Wrapped { remote: Record },
    Bare(Record),
}

impl ConflictBody {
    fn into_record(self) -> Record {
        match self {
            ConflictBody::Wrapped { remote } => remote,
            ConflictBody::Bare(record) => record,
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Transient transmission failure; the mutation will be retried
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

/// Map an HTTP response onto a push outcome
async fn handle_push_response(response: reqwest::Response) -> Result<PushOutcome, TransportError> {
    let status = response.status();

    match status {
        StatusCode::OK | StatusCode::CREATED => {
            let accepted = response
                .json::<Record>()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            Ok(PushOutcome::Accepted(accepted))
        }
        StatusCode::CONFLICT => {
            let remote = response
                .json::<ConflictBody>()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            Ok(PushOutcome::Conflict(remote.into_record()))
        }
        StatusCode::TOO_MANY_REQUESTS => Err(TransportError::RateLimited),
        StatusCode::REQUEST_TIMEOUT => Err(TransportError::Server {
            status: status.as_u16(),
            message: "request timeout".to_string(),
        }),
        s if s.is_server_error() => {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            Err(TransportError::Server {
                status: s.as_u16(),
                message,
            })
        }
        s if s.is_client_error() => {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            Ok(PushOutcome::Rejected(format!("{}: {}", s, message)))
        }
        s => Err(TransportError::InvalidResponse(format!("unexpected status {}", s))),
    }
}

// ============================================================================
// Tests
// ============================================================================
