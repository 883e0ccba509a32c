// Error handling module
// Defines the pipeline, backend and session error taxonomy

use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the API client and backend calls
///
/// The pipeline itself only ever returns `Transport`, `Credential`,
/// `InvalidRequest` and `Encode`. HTTP-level failures (including 401 after the
/// retry) come back as ordinary responses; `Status` and `Decode` are produced
/// by the typed backend helpers that interpret those responses.
#[derive(Error, Debug)]
pub enum ApiError {
    /// No response was obtained (DNS, connect, timeout, broken body)
    #[error("Transport error ({kind}): {source}")]
    Transport {
        kind: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The credential getter failed while resolving or refreshing a token
    #[error("Credential resolution failed: {0}")]
    Credential(anyhow::Error),

    /// The request descriptor could not be turned into an HTTP request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Structured body could not be serialized
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    /// Backend answered with a non-success status or an ERROR envelope
    #[error("Backend error: {status} - {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Build a transport error, categorizing the reqwest failure for logs
    pub fn transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };
        ApiError::Transport { kind, source: err }
    }

    /// True when no response was obtained at all
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport { .. })
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }
}

/// Failure of a sign-in, sign-up or sign-out operation
#[derive(Error, Debug)]
pub enum SessionError {
    /// The identity provider rejected or failed the operation
    #[error("{message}")]
    Provider {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// The provider half succeeded but the backend did not record the session
    #[error("{}", REGISTRATION_FAILED_MESSAGE)]
    Registration {
        #[source]
        source: ApiError,
    },
}

/// Shown when the backend refuses to materialize the signed-in principal
pub const REGISTRATION_FAILED_MESSAGE: &str = "Sign-up/sign-in processing failed.";

impl SessionError {
    /// Human-readable message retained on the session bridge
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
