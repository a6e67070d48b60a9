//! REST collaborators for history fetch, remote decrypt, and status checks.
//!
//! [`ChatApi`] is the seam between the synchronizer/status layers and the
//! HTTP backend. Production code uses [`HttpApi`] over reqwest; tests use
//! [`InMemoryApi`], a scriptable double with injectable failures and
//! latency.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use palisade_proto::message::Message;
use palisade_proto::status::AccountStatus;

/// Default timeout for any single HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from REST collaborator calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request did not complete within the timeout.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status code.
    #[error("server returned status {0}")]
    Status(u16),

    /// Transport-level failure (DNS, refused connection, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// REST operations the client core consumes.
pub trait ChatApi: Send + Sync {
    /// Fetches the full message history for a conversation pair.
    fn fetch_history(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Asks the server to decrypt a stored message it holds the key for.
    fn decrypt_remote(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    /// Fetches the current account status for an identity.
    fn user_status(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<AccountStatus, ApiError>> + Send;
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest<'a> {
    message_id: &'a str,
    receiver_id: &'a str,
}

#[derive(serde::Deserialize)]
struct DecryptResponse {
    content: String,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    status: String,
}

/// [`ChatApi`] over HTTP with reqwest.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Creates an API client for the given base URL (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    /// Creates an API client with an explicit per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the HTTP client cannot be built.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ChatApi for HttpApi {
    async fn fetch_history(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let url = format!("{}/chat/history/{sender_id}/{receiver_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn decrypt_remote(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> Result<String, ApiError> {
        let url = format!("{}/chat/decrypt", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&DecryptRequest {
                message_id,
                receiver_id,
            })
            .send()
            .await?;
        let response = response.error_for_status()?;
        let body: DecryptResponse = response.json().await?;
        Ok(body.content)
    }

    async fn user_status(&self, email: &str) -> Result<AccountStatus, ApiError> {
        let url = format!("{}/api/users/status/{email}", self.base_url);
        let response = self.client.get(&url).send().await?;
        let response = response.error_for_status()?;
        let body: StatusResponse = response.json().await?;
        body.status
            .parse()
            .map_err(|e| ApiError::Decode(format!("{e}")))
    }
}

/// Scriptable in-memory [`ChatApi`] for tests.
///
/// History, statuses, and decrypt results are pre-loaded; calls can be made
/// to fail or to complete after an artificial delay (for superseded-fetch
/// scenarios).
#[derive(Default)]
pub struct InMemoryApi {
    inner: parking_lot::Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    history: Vec<Message>,
    statuses: HashMap<String, AccountStatus>,
    decrypts: HashMap<String, String>,
    fail_history: bool,
    fail_status: bool,
    history_delay: Option<Duration>,
    history_calls: u32,
}

impl InMemoryApi {
    /// Creates an empty double: no history, no statuses, no failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the scripted history returned by `fetch_history`.
    pub fn set_history(&self, messages: Vec<Message>) {
        self.inner.lock().history = messages;
    }

    /// Scripts the status returned for an identity.
    pub fn set_status(&self, email: &str, status: AccountStatus) {
        self.inner.lock().statuses.insert(email.to_string(), status);
    }

    /// Scripts the plaintext returned by `decrypt_remote` for a message id.
    pub fn set_decrypt(&self, message_id: &str, plaintext: &str) {
        self.inner
            .lock()
            .decrypts
            .insert(message_id.to_string(), plaintext.to_string());
    }

    /// Makes subsequent `fetch_history` calls fail with a network error.
    pub fn fail_history(&self, fail: bool) {
        self.inner.lock().fail_history = fail;
    }

    /// Makes subsequent `user_status` calls fail with a network error.
    pub fn fail_status(&self, fail: bool) {
        self.inner.lock().fail_status = fail;
    }

    /// Delays `fetch_history` completion by the given duration.
    pub fn delay_history(&self, delay: Duration) {
        self.inner.lock().history_delay = Some(delay);
    }

    /// Number of `fetch_history` calls made so far.
    #[must_use]
    pub fn history_calls(&self) -> u32 {
        self.inner.lock().history_calls
    }
}

impl ChatApi for InMemoryApi {
    async fn fetch_history(
        &self,
        _sender_id: &str,
        _receiver_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let (delay, result) = {
            let mut inner = self.inner.lock();
            inner.history_calls += 1;
            let result = if inner.fail_history {
                Err(ApiError::Network("scripted failure".to_string()))
            } else {
                Ok(inner.history.clone())
            };
            (inner.history_delay, result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn decrypt_remote(
        &self,
        message_id: &str,
        _receiver_id: &str,
    ) -> Result<String, ApiError> {
        self.inner
            .lock()
            .decrypts
            .get(message_id)
            .cloned()
            .ok_or(ApiError::Status(404))
    }

    async fn user_status(&self, email: &str) -> Result<AccountStatus, ApiError> {
        let inner = self.inner.lock();
        if inner.fail_status {
            return Err(ApiError::Network("scripted failure".to_string()));
        }
        inner
            .statuses
            .get(email)
            .copied()
            .ok_or(ApiError::Status(404))
    }
}
