//! Bridge configuration
//!
//! Settings can come from command line flags or from a TOML file. Both paths
//! fill a [`BridgeSettings`] and go through the same validation to produce a
//! [`BridgeConfig`].
//!
//! ```toml
//! mqtt-url = "mqtt://broker.example.com:1883"
//! topics = ["sensors/#", "alerts/+"]
//! api-key = "..."
//! stream-name-template = "mqtt: $topic"
//! topic-levels = 1
//! reconnect-on-data-timeout = 600
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const TOPIC_PLACEHOLDER: &str = "$topic";
pub const DEFAULT_PLATFORM_URL: &str = "https://streamr.network/api/v1";
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DATA_TIMEOUT_SECS: u64 = 900;
/// Upper bound for interval and timeout settings (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Either an API key or a private key must be given to authenticate to Streamr")]
    MissingCredential,
    #[error("Missing required option: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Credential used to authenticate against the destination platform.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    PrivateKey(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credential::PrivateKey(_) => f.write_str("PrivateKey(***)"),
        }
    }
}

/// Raw settings as given by the user. Every field is optional so that flags
/// and files can share one shape; [`BridgeSettings::into_config`] applies
/// defaults and validates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BridgeSettings {
    pub mqtt_url: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub api_key: Option<String>,
    pub private_key: Option<String>,
    pub client_id: Option<String>,
    pub streamr_rest_url: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub public: bool,
    pub stream_name_template: Option<String>,
    pub stream_id: Option<String>,
    pub topic_levels: Option<i32>,
    pub transform: Option<String>,
    pub log_interval: Option<u64>,
    pub reconnect_on_data_timeout: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
}

impl BridgeSettings {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn into_config(self) -> Result<BridgeConfig> {
        let broker_url = non_empty(self.mqtt_url).ok_or(ConfigError::MissingField("mqtt-url"))?;

        let topics: Vec<String> = self
            .topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(ConfigError::MissingField("topic"));
        }

        let api_key = non_empty(self.api_key);
        let private_key = non_empty(self.private_key);
        let credential = match (api_key, private_key) {
            (Some(key), other) => {
                if other.is_some() {
                    warn!("Both api-key and private-key given, using api-key");
                }
                Credential::ApiKey(key)
            }
            (None, Some(key)) => Credential::PrivateKey(key),
            (None, None) => return Err(ConfigError::MissingCredential),
        };

        let report_interval_secs = self.log_interval.unwrap_or(DEFAULT_REPORT_INTERVAL_SECS);
        if report_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "log-interval",
                message: "must be greater than zero".to_string(),
            });
        }
        check_max("log-interval", report_interval_secs)?;

        let data_timeout_secs = self
            .reconnect_on_data_timeout
            .unwrap_or(DEFAULT_DATA_TIMEOUT_SECS);
        check_max("reconnect-on-data-timeout", data_timeout_secs)?;

        let platform_url = non_empty(self.streamr_rest_url)
            .unwrap_or_else(|| DEFAULT_PLATFORM_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client_id = non_empty(self.client_id)
            .unwrap_or_else(|| format!("mqtt-streamr-{}", uuid::Uuid::new_v4().simple()));

        Ok(BridgeConfig {
            broker_url,
            topics,
            client_id,
            credential,
            platform_url,
            verbose: self.verbose,
            make_public: self.public,
            stream_name_template: self
                .stream_name_template
                .unwrap_or_else(|| TOPIC_PLACEHOLDER.to_string()),
            stream_id: non_empty(self.stream_id),
            topic_levels: self.topic_levels,
            transform: non_empty(self.transform),
            report_interval_secs,
            data_timeout_secs,
            dry_run: self.dry_run,
        })
    }
}

fn check_max(field: &'static str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid {
            field,
            message: format!("must be at most {} seconds", MAX_DURATION_SECS),
        });
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validated bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker_url: String,
    pub topics: Vec<String>,
    pub client_id: String,
    pub credential: Credential,
    pub platform_url: String,
    pub verbose: bool,
    /// Grant public read on every auto-created stream
    pub make_public: bool,
    pub stream_name_template: String,
    /// Publish everything to this pre-existing stream; disables auto-creation
    pub stream_id: Option<String>,
    pub topic_levels: Option<i32>,
    pub transform: Option<String>,
    pub report_interval_secs: u64,
    /// 0 disables the silence timeout
    pub data_timeout_secs: u64,
    pub dry_run: bool,
}

impl BridgeConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Silence period after which the broker connection is recycled, if enabled.
    pub fn silence_timeout(&self) -> Option<Duration> {
        match self.data_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
