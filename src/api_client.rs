use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("could not reach the server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("unexpected response from server: {0}")]
    Malformed(String),

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

/// Why a chat request did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Transport(String),
    Status(u16),
    Malformed(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transport(reason) => write!(f, "transport error: {}", reason),
            FailureKind::Status(code) => write!(f, "status {}", code),
            FailureKind::Malformed(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

/// Validated outcome of one chat round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    Success(String),
    Failure(FailureKind),
}

impl From<ApiError> for FailureKind {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(e) => FailureKind::Transport(e.to_string()),
            ApiError::Status { status, .. } => FailureKind::Status(status.as_u16()),
            ApiError::Malformed(reason) => FailureKind::Malformed(reason),
            ApiError::Url(e) => FailureKind::Transport(e.to_string()),
        }
    }
}

/// Anything that can answer a user message.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, message: &str) -> ChatReply;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    response: String,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SignupRequest<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// HTTP client for the Dr. Chatbot API. Every endpoint hangs off one base url.
pub struct ApiClient {
    base_url: Url,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join `name` onto the base url, keeping any path prefix the base has.
    fn endpoint(&self, name: &str) -> Result<Url, ApiError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(name)?)
    }

    pub async fn chat(&self, message: &str) -> Result<String, ApiError> {
        let response: ChatResponse = self.post_json("chat", &ChatRequest { message }).await?;
        Ok(response.response)
    }

    pub async fn login(&self, request: &LoginRequest<'_>) -> Result<AuthResponse, ApiError> {
        self.post_json("login", request).await
    }

    pub async fn signup(&self, request: &SignupRequest<'_>) -> Result<AuthResponse, ApiError> {
        self.post_json("signup", request).await
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        let url = self.endpoint("")?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn post_json<B, R>(&self, name: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(name)?;
        debug!("POST {}", url);

        let response = self.client.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                detail: error_detail(status, &text),
            });
        }

        debug!("Received response body: {}", text);
        serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn send_message(&self, message: &str) -> ChatReply {
        match self.chat(message).await {
            Ok(reply) => ChatReply::Success(reply),
            Err(e) => {
                error!("Chat request failed: {}", e);
                ChatReply::Failure(e.into())
            }
        }
    }
}

/// Pull a human readable reason out of an error body. The API reports
/// failures as `{"detail": ...}`; anything else falls back to the status line.
fn error_detail(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").cloned());

    match detail {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(other) if !other.is_null() => other.to_string(),
        _ => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}
