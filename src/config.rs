// Client configuration.
//
// Everything the protocol needs from its environment (backend URL, auth
// token, upload tuning) is gathered here and handed to the client and the
// coordinator at construction. Nothing downstream reads env vars itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;

pub const BASE_URL_ENV: &str = "CI_UPLOAD_API_URL";
pub const TOKEN_ENV: &str = "CI_UPLOAD_TOKEN";
pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";
const TOKEN_FILE_NAME: &str = ".ci_upload_token";

/// Supplies the bearer token for backend calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, BackendError>;
}

/// A token known up front (flag or env var).
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, BackendError> {
        Ok(self.0.clone())
    }
}

/// A token read from a file on each call, so a refreshed file is picked up.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TokenFile { path: path.into() }
    }

    /// `~/.ci_upload_token`, or `./.ci_upload_token` when there is no home dir.
    pub fn default_location() -> Self {
        let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        TokenFile::new(dir.join(TOKEN_FILE_NAME))
    }
}

#[async_trait]
impl TokenProvider for TokenFile {
    async fn token(&self) -> Result<String, BackendError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| BackendError::Auth(format!("cannot read {}: {e}", self.path.display())))?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(BackendError::Auth(format!("{} is empty", self.path.display())));
        }
        Ok(token.to_string())
    }
}

/// Where to reach the backend and how to authenticate.
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token_provider: Arc<dyn TokenProvider>,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            token_provider: Arc::new(StaticToken::new(token)),
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Read `CI_UPLOAD_API_URL` and `CI_UPLOAD_TOKEN`, falling back to the
    /// default URL and the token file in the home directory.
    pub fn from_env() -> Self {
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let token_provider: Arc<dyn TokenProvider> = match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Arc::new(StaticToken::new(token.trim())),
            _ => Arc::new(TokenFile::default_location()),
        };
        ClientConfig {
            base_url,
            token_provider,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token_provider = Arc::new(StaticToken::new(token));
        self
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait before `attempt` (1-based). The first attempt is immediate;
    /// after that the delay doubles each time up to `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// What happens to in-flight uploads once one slot has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotFailurePolicy {
    /// Let transfers already started finish, acknowledging only the ones that
    /// succeeded, then report the first failure.
    #[default]
    DrainInFlight,
    /// Drop in-flight work immediately.
    AbortInFlight,
}

/// Tuning for the upload phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub max_concurrent_uploads: usize,
    pub completion_retry: RetryPolicy,
    pub on_slot_failure: SlotFailurePolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            max_concurrent_uploads: 4,
            completion_retry: RetryPolicy::default(),
            on_slot_failure: SlotFailurePolicy::default(),
        }
    }
}
