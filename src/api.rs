// Backend API: protocol types and the HTTP client that speaks them.
//
// The whole wire contract is four calls: start a session, negotiate upload
// slots, acknowledge a finished upload, and read the session back. The
// coordinator only talks to the `BackendClient` trait so the protocol logic
// can be exercised against an in-memory backend.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifacts::ArtifactKind;
use crate::config::{ClientConfig, TokenProvider};
use crate::error::BackendError;

/// Backend-assigned identity of one run. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

/// Identity of one single-use upload slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(s: &str) -> Self {
        SlotId(s.to_string())
    }
}

impl From<String> for SlotId {
    fn from(s: String) -> Self {
        SlotId(s)
    }
}

/// Origin of a run. Decides which provider metadata field is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    GithubActions,
    GitlabCi,
    Manual,
}

/// Lifecycle state of a session as reported by the backend.
///
/// Only three states matter to the client: not yet usable, usable, errored.
/// Any state the client does not know is treated as not yet usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[serde(alias = "Ready")]
    Ready,
    #[serde(alias = "error", alias = "Error", alias = "Failed")]
    Failed,
    #[serde(alias = "started", alias = "Started", alias = "Pending", other)]
    Pending,
}

impl SessionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionStatus::Pending)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Arguments the run was invoked with, forwarded as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    pub from: Option<String>,
    pub to: Option<String>,
    pub context: Option<String>,
    pub rules: Option<String>,
}

/// CI-provider metadata. The payload is opaque; only the variant picks the
/// field name it is sent under.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMetadata {
    GithubData(serde_json::Value),
    GitlabData(serde_json::Value),
    ManualData(serde_json::Value),
}

impl ProviderMetadata {
    pub fn session_type(&self) -> SessionType {
        match self {
            ProviderMetadata::GithubData(_) => SessionType::GithubActions,
            ProviderMetadata::GitlabData(_) => SessionType::GitlabCi,
            ProviderMetadata::ManualData(_) => SessionType::Manual,
        }
    }
}

/// Body of `start_session`.
#[derive(Debug, Clone, Serialize)]
pub struct StartSessionRequest {
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub run_args: RunArgs,
    #[serde(flatten)]
    pub provider_metadata: ProviderMetadata,
}

impl StartSessionRequest {
    /// Build a request whose `type` always agrees with the metadata variant.
    pub fn new(run_args: RunArgs, provider_metadata: ProviderMetadata) -> Self {
        Self {
            session_type: provider_metadata.session_type(),
            run_args,
            provider_metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct UploadUrlsRequest<'a> {
    slots: &'a [ArtifactKind],
}

#[derive(Debug, Serialize)]
struct CompleteUploadRequest {
    status: &'static str,
}

/// A one-time upload destination for one artifact kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSlot {
    pub id: SlotId,
    #[serde(alias = "slot")]
    pub kind: ArtifactKind,
    pub url: String,
}

/// Session as read back from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionReport {
    #[serde(default)]
    pub web_url: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub session: serde_json::Value,
    #[serde(default)]
    pub files: Vec<serde_json::Value>,
}

/// The backend wire contract.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn start_session(&self, request: &StartSessionRequest)
        -> Result<SessionId, BackendError>;

    /// Returns the subset of `kinds` the backend wants uploaded. May be empty.
    async fn get_upload_urls(
        &self,
        session_id: &SessionId,
        kinds: &[ArtifactKind],
    ) -> Result<Vec<UploadSlot>, BackendError>;

    /// Idempotent on the backend side.
    async fn mark_upload_as_complete(
        &self,
        session_id: &SessionId,
        slot_id: &SlotId,
    ) -> Result<(), BackendError>;

    async fn get_session(&self, session_id: &SessionId) -> Result<SessionReport, BackendError>;
}

/// HTTP implementation of [`BackendClient`].
#[derive(Clone)]
pub struct HttpBackendClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpBackendClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("ci-upload/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpBackendClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens: Arc::clone(&config.token_provider),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn auth_headers(&self) -> Result<HeaderMap, BackendError> {
        let token = self.tokens.token().await?;
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            BackendError::Auth("token contains characters not allowed in a header".into())
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// Send an authenticated request and return the raw body of a 2xx response.
    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<String, BackendError> {
        let res = request
            .headers(self.auth_headers().await?)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let status = res.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        let body = res.text().await.map_err(|source| BackendError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;
        debug!(endpoint, status = status.as_u16(), "backend responded");
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &str,
    ) -> Result<T, BackendError> {
        let body = self.send(request, endpoint).await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn start_session(
        &self,
        request: &StartSessionRequest,
    ) -> Result<SessionId, BackendError> {
        let url = self.endpoint("/api/sessions");
        let resp: StartSessionResponse =
            self.send_json(self.client.post(&url).json(request), &url).await?;
        Ok(resp.session_id)
    }

    async fn get_upload_urls(
        &self,
        session_id: &SessionId,
        kinds: &[ArtifactKind],
    ) -> Result<Vec<UploadSlot>, BackendError> {
        let url = self.endpoint(&format!("/api/sessions/{session_id}/upload-urls"));
        let body = UploadUrlsRequest { slots: kinds };
        self.send_json(self.client.post(&url).json(&body), &url).await
    }

    async fn mark_upload_as_complete(
        &self,
        session_id: &SessionId,
        slot_id: &SlotId,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&format!("/api/sessions/{session_id}/uploads/{slot_id}"));
        let body = CompleteUploadRequest { status: "verified" };
        self.send(self.client.patch(&url).json(&body), &url).await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<SessionReport, BackendError> {
        let url = self.endpoint(&format!("/api/sessions/{session_id}"));
        self.send_json(self.client.get(&url), &url).await
    }
}
