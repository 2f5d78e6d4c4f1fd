//! Destination platform client
//!
//! The bridge talks to the stream platform only through [`StreamPlatform`]:
//! - get-or-create a stream by name
//! - check and grant stream permissions
//! - publish a JSON payload to a stream
//!
//! [`StreamrRestClient`] implements it over the platform's REST API.

pub mod auth;
pub mod rest;

use async_trait::async_trait;
use ms_common::{Principal, StreamHandle, StreamOperation};
use thiserror::Error;

pub use auth::EthereumSigner;
pub use rest::{RestClientConfig, StreamrRestClient};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            PlatformError::Status { status, .. } => Some(*status),
            PlatformError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

#[async_trait]
pub trait StreamPlatform: Send + Sync {
    /// Look up a stream owned by the caller by exact name, creating it if absent.
    async fn get_or_create_stream(&self, name: &str) -> Result<StreamHandle>;

    async fn has_permission(
        &self,
        stream: &StreamHandle,
        operation: StreamOperation,
        principal: &Principal,
    ) -> Result<bool>;

    async fn grant_permission(
        &self,
        stream: &StreamHandle,
        operation: StreamOperation,
        principal: &Principal,
    ) -> Result<()>;

    async fn publish(&self, stream_id: &str, payload: &serde_json::Value) -> Result<()>;
}
