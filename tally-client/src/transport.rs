//! Merge submission transport
//!
//! The reconciler queue talks to the Merge Service through this trait so
//! tests can script failures without a server. The real implementation posts
//! to `/api/counter` with the verified identity headers the auth layer
//! expects to see.

use async_trait::async_trait;
use tally_common::api::{
    Identity, MergeRequest, MergeResponse, ACTOR_ID_HEADER, DISPLAY_NAME_HEADER,
};
use thiserror::Error;

/// Transport-level merge submission errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (DNS, reset, timeout)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server rejected the submission (validation or authorization);
    /// resubmitting the same request cannot succeed
    #[error("Merge rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Server-side failure (persistence unavailable); safe to retry
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Response did not match the merge protocol
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the reconciler should retry this submission with backoff.
    ///
    /// Rejections (validation, authorization) are surfaced and never
    /// retried; transient network and server failures are.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Server { .. } => true,
            TransportError::Rejected { .. } | TransportError::Protocol(_) => false,
        }
    }
}

/// Submits proposed counter totals to the Merge Service
#[async_trait]
pub trait MergeTransport: Send + Sync + 'static {
    /// Submit a proposed total for `owner_id` and return the confirmed value
    async fn submit(&self, owner_id: &str, proposed: u64) -> Result<u64, TransportError>;
}

/// HTTP transport posting to the tally-server counter endpoint
pub struct HttpMergeTransport {
    client: reqwest::Client,
    base_url: String,
    identity: Identity,
}

impl HttpMergeTransport {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:5730`
    pub fn new(base_url: impl Into<String>, identity: Identity) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            identity,
        }
    }
}

#[async_trait]
impl MergeTransport for HttpMergeTransport {
    async fn submit(&self, owner_id: &str, proposed: u64) -> Result<u64, TransportError> {
        let request = MergeRequest {
            owner_id: owner_id.to_string(),
            proposed_value: proposed as i64,
        };

        let mut builder = self
            .client
            .post(format!("{}/api/counter", self.base_url))
            .header(ACTOR_ID_HEADER, &self.identity.actor_id)
            .json(&request);
        if let Some(name) = &self.identity.display_name {
            builder = builder.header(DISPLAY_NAME_HEADER, name);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body: MergeResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if status.is_success() && body.success {
            body.new_count
                .ok_or_else(|| TransportError::Protocol("missing new_count".to_string()))
        } else {
            let message = body
                .error
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            if status.is_client_error() {
                Err(TransportError::Rejected {
                    status: status.as_u16(),
                    message,
                })
            } else {
                Err(TransportError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
