use serde::{Deserialize, Serialize};
use std::fmt;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Destination Stream Types
// ============================================================================

/// Reference to a stream on the destination platform.
///
/// Obtained once per route key and then shared by every message routed to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHandle {
    pub id: String,
    pub name: String,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Handle for a pre-existing stream that is only known by id.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOperation {
    Read,
    Write,
    Share,
    Delete,
}

impl StreamOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOperation::Read => "read",
            StreamOperation::Write => "write",
            StreamOperation::Share => "share",
            StreamOperation::Delete => "delete",
        }
    }
}

/// Who a permission applies to. `Anyone` is the public (anonymous) principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    Anyone,
    User(String),
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}
