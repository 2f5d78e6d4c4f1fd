//! Bridge Error Types

use std::sync::Arc;
use ms_broker::BrokerError;
use ms_platform::PlatformError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TransformError {
    #[error("Invalid transform expression: {0}")]
    Compile(String),

    #[error("Transform evaluation failed: {0}")]
    Evaluate(String),
}

/// Per-message and connection failures.
///
/// `Clone` because a failed stream resolution is handed to every caller
/// waiting on the same route key.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Failed to resolve stream {route_key}: {source}")]
    Resolution {
        route_key: String,
        #[source]
        source: Arc<PlatformError>,
    },

    #[error("Failed to publish to {stream}: {source}")]
    Publish {
        stream: String,
        #[source]
        source: Arc<PlatformError>,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Broker error: {0}")]
    Broker(Arc<BrokerError>),
}

impl BridgeError {
    pub fn resolution(route_key: impl Into<String>, source: PlatformError) -> Self {
        Self::Resolution {
            route_key: route_key.into(),
            source: Arc::new(source),
        }
    }

    pub fn publish(stream: impl Into<String>, source: PlatformError) -> Self {
        Self::Publish {
            stream: stream.into(),
            source: Arc::new(source),
        }
    }
}

impl From<BrokerError> for BridgeError {
    fn from(e: BrokerError) -> Self {
        Self::Broker(Arc::new(e))
    }
}
