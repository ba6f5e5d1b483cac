//! Gateway and API error types.

use std::fmt;

use reqwest::{Response, StatusCode};
use serde::Deserialize;

/// Failure to obtain any response from the backend.
///
/// Authentication outcomes are never errors: they come back as responses.
#[derive(Debug)]
pub enum GatewayError {
    /// The HTTP client could not be constructed.
    Client(String),
    /// The request could not be sent or its response not received.
    Transport(reqwest::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(msg) => write!(f, "Failed to create HTTP client: {}", msg),
            Self::Transport(err) => write!(f, "Request failed: {}", err),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Client(_) => None,
        }
    }
}

/// Error body shape returned by the backend. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// Best-effort parse; anything that is not a JSON object yields an empty body.
    pub(crate) fn parse(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }
}

/// Error surfaced by the typed JSON helpers of the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The backend answered with a non-success status.
    Status { status: u16, message: String },
    /// No response was obtained.
    Transport(String),
    /// The request body could not be serialized.
    Encode(String),
    /// The success body did not match the expected shape.
    Decode(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { status, message } => write!(f, "HTTP {}: {}", status, message),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Encode(msg) => write!(f, "Failed to encode request: {}", msg),
            Self::Decode(msg) => write!(f, "Failed to decode response: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }

    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN.as_u16())
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// Pass successful responses through, turn the rest into `ApiError`.
    pub async fn check(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::from_response(response).await)
        }
    }

    /// Build an error from a failed response.
    ///
    /// The message is `error`, then `message` from a JSON body, then the raw
    /// body text, then a description of the status. A body that cannot be
    /// read never hides the status.
    pub async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        Self::from_parts(status, &body)
    }

    pub(crate) fn from_parts(status: StatusCode, body: &[u8]) -> Self {
        let parsed = ErrorBody::parse(body);
        let message = parsed
            .error
            .or(parsed.message)
            .filter(|m| !m.trim().is_empty())
            .or_else(|| {
                let text = String::from_utf8_lossy(body).trim().to_string();
                (!text.is_empty() && !text.starts_with('{')).then_some(text)
            })
            .unwrap_or_else(|| status_message(status));

        Self::Status {
            status: status.as_u16(),
            message,
        }
    }
}

fn status_message(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("Request failed with status {} {}", status.as_u16(), reason),
        None => format!("Request failed with status {}", status.as_u16()),
    }
}
