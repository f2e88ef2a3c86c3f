use fleetdeck_core::{RunnerInstance, RunnerSpec, WriteCredential};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub mod http;

pub use http::{HttpLogStream, HttpTransport};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no credential available")]
    MissingCredential,
    #[error("unauthorized")]
    Unauthorized,
    #[error("server rejected request ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Where the session credential comes from. Injectable so tests and the CLI
/// can substitute an in-memory slot for the process environment.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, credential: &str);
    fn clear(&self);
}

pub struct EnvCredentialStore {
    var: String,
}

impl EnvCredentialStore {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialStore for EnvCredentialStore {
    fn load(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    // the environment is read-only from here
    fn store(&self, _credential: &str) {}

    fn clear(&self) {}
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(credential.into())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<String> {
        self.slot.lock().unwrap().clone()
    }

    fn store(&self, credential: &str) {
        *self.slot.lock().unwrap() = Some(credential.to_string());
    }

    fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Explicit session state handed to the transport at construction: base URL
/// plus the bearer credential. Replaces any notion of ambient process-wide
/// auth state.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    credential: WriteCredential,
}

impl Session {
    pub fn new(config: SessionConfig, credential: WriteCredential) -> Self {
        Self { config, credential }
    }

    pub fn from_store(
        config: SessionConfig,
        store: &dyn CredentialStore,
    ) -> Result<Self, ApiError> {
        let raw = store.load().ok_or(ApiError::MissingCredential)?;
        Ok(Self::new(config, WriteCredential::new(raw)))
    }

    pub fn credential(&self) -> &WriteCredential {
        &self.credential
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// Pull-based byte source for one log stream. `Ok(None)` is clean
/// end-of-stream; cancellation is simply dropping the source.
pub trait LogChunkSource {
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, ApiError>> + Send;
}

/// The remote fleet authority. One implementation speaks HTTP; tests swap in
/// scripted fakes.
pub trait RunnerTransport {
    type LogStream: LogChunkSource + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<RunnerInstance>, ApiError>> + Send;

    fn create(
        &self,
        spec: &RunnerSpec,
        credential: &WriteCredential,
    ) -> impl Future<Output = Result<RunnerInstance, ApiError>> + Send;

    fn update_credential(
        &self,
        id: u64,
        credential: &WriteCredential,
    ) -> impl Future<Output = Result<RunnerInstance, ApiError>> + Send;

    fn delete(&self, id: u64) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn start(&self, id: u64) -> impl Future<Output = Result<RunnerInstance, ApiError>> + Send;

    fn stop(&self, id: u64) -> impl Future<Output = Result<RunnerInstance, ApiError>> + Send;

    fn restart(&self, id: u64) -> impl Future<Output = Result<RunnerInstance, ApiError>> + Send;

    fn clone_runners(
        &self,
        id: u64,
        count: u32,
        credential: Option<&WriteCredential>,
    ) -> impl Future<Output = Result<Vec<RunnerInstance>, ApiError>> + Send;

    fn open_log_stream(
        &self,
        id: u64,
    ) -> impl Future<Output = Result<Self::LogStream, ApiError>> + Send;

    fn clear_logs(&self, id: u64) -> impl Future<Output = Result<(), ApiError>> + Send;
}
