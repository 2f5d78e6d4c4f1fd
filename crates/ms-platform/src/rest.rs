//! REST client for the Streamr platform API
//!
//! Sessions are obtained with the configured credential and cached; a 401
//! drops the cached session and the request is retried once.

use std::time::Duration;
use async_trait::async_trait;
use ms_common::{Principal, StreamHandle, StreamOperation};
use ms_config::Credential;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::EthereumSigner;
use crate::{PlatformError, Result, StreamPlatform};

/// REST client configuration
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Platform REST API base URL, e.g. `https://streamr.network/api/v1`
    pub base_url: String,
    pub credential: Credential,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyLogin<'a> {
    api_key: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Challenge {
    id: String,
    challenge: String,
}

#[derive(Debug, Serialize)]
struct ChallengeResponse<'a> {
    challenge: &'a Challenge,
    signature: String,
    address: &'a str,
}

#[derive(Debug, Deserialize)]
struct Session {
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateStream<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    id: String,
    name: String,
}

impl From<StreamResponse> for StreamHandle {
    fn from(stream: StreamResponse) -> Self {
        StreamHandle::new(stream.id, stream.name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PermissionEntry {
    operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(default)]
    anonymous: bool,
}

impl PermissionEntry {
    fn new(operation: StreamOperation, principal: &Principal) -> Self {
        match principal {
            Principal::Anyone => Self {
                operation: operation.as_str().to_string(),
                user: None,
                anonymous: true,
            },
            Principal::User(user) => Self {
                operation: operation.as_str().to_string(),
                user: Some(user.clone()),
                anonymous: false,
            },
        }
    }

    fn grants(&self, operation: StreamOperation, principal: &Principal) -> bool {
        if self.operation != operation.as_str() {
            return false;
        }
        match principal {
            Principal::Anyone => self.anonymous,
            Principal::User(user) => self
                .user
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(user)),
        }
    }
}

pub struct StreamrRestClient {
    config: RestClientConfig,
    client: reqwest::Client,
    signer: Option<EthereumSigner>,
    session: Mutex<Option<String>>,
}

impl StreamrRestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let signer = match &config.credential {
            Credential::PrivateKey(key) => Some(EthereumSigner::from_hex(key)?),
            Credential::ApiKey(_) => None,
        };

        Ok(Self {
            config,
            client,
            signer,
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn login(&self) -> Result<String> {
        let response = match (&self.config.credential, &self.signer) {
            (Credential::ApiKey(api_key), _) => {
                debug!("Logging in with API key");
                self.client
                    .post(self.url("/login/apikey"))
                    .json(&ApiKeyLogin { api_key })
                    .send()
                    .await?
            }
            (Credential::PrivateKey(_), Some(signer)) => {
                debug!(address = %signer.address(), "Logging in with private key");
                let response = self
                    .client
                    .post(self.url(&format!("/login/challenge/{}", signer.address())))
                    .send()
                    .await?;
                let challenge: Challenge = ensure_success("POST", response).await?.json().await?;
                let signature = signer.personal_sign(&challenge.challenge)?;

                self.client
                    .post(self.url("/login/response"))
                    .json(&ChallengeResponse {
                        challenge: &challenge,
                        signature,
                        address: signer.address(),
                    })
                    .send()
                    .await?
            }
            (Credential::PrivateKey(_), None) => {
                return Err(PlatformError::Auth("private key signer not initialised".to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Auth(format!("login returned {}: {}", status, body)));
        }

        let session: Session = response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(format!("login response: {}", e)))?;
        info!("Authenticated to Streamr at {}", self.config.base_url);
        Ok(session.token)
    }

    async fn session_token(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *session = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_session(&self, stale: &str) {
        let mut session = self.session.lock().await;
        if session.as_deref() == Some(stale) {
            *session = None;
        }
    }

    /// Send an authenticated request, re-authenticating once on 401.
    async fn send<F>(&self, method: Method, path: &str, build: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let url = self.url(path);
        let token = self.session_token().await?;
        let response = build(self.client.request(method.clone(), &url))
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(method.as_str(), response).await;
        }

        warn!("Session rejected by {}, re-authenticating", url);
        self.invalidate_session(&token).await;
        let token = self.session_token().await?;
        let response = build(self.client.request(method.clone(), &url))
            .bearer_auth(&token)
            .send()
            .await?;
        ensure_success(method.as_str(), response).await
    }
}

async fn ensure_success(method: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::Status {
        method: method.to_string(),
        url,
        status: status.as_u16(),
        body,
    })
}

fn stream_path(stream_id: &str) -> String {
    // Stream ids may contain '/' (e.g. "0xabc.../sensors")
    format!("/streams/{}", urlencoding::encode(stream_id))
}

#[async_trait]
impl StreamPlatform for StreamrRestClient {
    async fn get_or_create_stream(&self, name: &str) -> Result<StreamHandle> {
        let existing: Vec<StreamResponse> = self
            .send(Method::GET, "/streams", |req| req.query(&[("name", name)]))
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Decode(format!("stream list: {}", e)))?;

        if let Some(stream) = existing.into_iter().find(|s| s.name == name) {
            debug!(stream = %stream.id, "Found existing stream");
            return Ok(stream.into());
        }

        let created: StreamResponse = self
            .send(Method::POST, "/streams", |req| req.json(&CreateStream { name }))
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Decode(format!("created stream: {}", e)))?;

        info!(stream = %created.id, name = %created.name, "Created stream");
        Ok(created.into())
    }

    async fn has_permission(
        &self,
        stream: &StreamHandle,
        operation: StreamOperation,
        principal: &Principal,
    ) -> Result<bool> {
        let path = format!("{}/permissions", stream_path(&stream.id));
        let permissions: Vec<PermissionEntry> = self
            .send(Method::GET, &path, |req| req)
            .await?
            .json()
            .await
            .map_err(|e| PlatformError::Decode(format!("permissions: {}", e)))?;

        Ok(permissions.iter().any(|p| p.grants(operation, principal)))
    }

    async fn grant_permission(
        &self,
        stream: &StreamHandle,
        operation: StreamOperation,
        principal: &Principal,
    ) -> Result<()> {
        let path = format!("{}/permissions", stream_path(&stream.id));
        let entry = PermissionEntry::new(operation, principal);
        self.send(Method::POST, &path, |req| req.json(&entry)).await?;
        Ok(())
    }

    async fn publish(&self, stream_id: &str, payload: &serde_json::Value) -> Result<()> {
        let path = format!("{}/data", stream_path(stream_id));
        self.send(Method::POST, &path, |req| req.json(payload)).await?;
        Ok(())
    }
}
