// Backend API endpoints
// Typed helpers over the authenticated pipeline

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::Credential;
use crate::error::{ApiError, Result};
use crate::http_client::{ApiClient, ApiRequest, ApiResponse};

/// Registers (or updates) the member record for a signed-in principal
pub const REGISTER_SESSION_PATH: &str = "/v1/auth/firebase";

/// Current member profile
pub const ME_PATH: &str = "/v1/auth/me";

/// Server and database health
pub const HEALTH_PATH: &str = "/v1/health";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Error details in an ERROR envelope
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
}

/// Response wrapper used by every backend endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: EnvelopeStatus,
    pub data: Option<T>,
    pub error: Option<EnvelopeError>,
}

/// Member record as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub member_id: i64,
    pub firebase_uid: String,
    pub email: Option<String>,
    pub is_new_member: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub server: String,
    pub db: String,
}

/// Backend API client
#[derive(Clone)]
pub struct BackendApi {
    client: Arc<ApiClient>,
}

impl BackendApi {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Underlying pipeline, for calls without a typed helper
    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    /// Let the backend materialize the principal behind `id_token`
    ///
    /// Presents the given token directly, in one physical call: the token was
    /// just issued, so there is nothing to refresh.
    pub async fn register_session(&self, id_token: &Credential) -> Result<AuthProfile> {
        let response = self
            .client
            .call_as(ApiRequest::post(REGISTER_SESSION_PATH), id_token)
            .await?;
        let profile: AuthProfile = interpret(response)?;

        tracing::info!(
            member_id = profile.member_id,
            new_member = profile.is_new_member,
            "Session registered with backend"
        );
        Ok(profile)
    }

    /// Profile of the currently signed-in member
    pub async fn me(&self) -> Result<AuthProfile> {
        interpret(self.client.get(ME_PATH).await?)
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        interpret(self.client.get(HEALTH_PATH).await?)
    }
}

/// Unwrap an envelope, turning non-success into `ApiError::Status`
pub fn interpret<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
    let status = response.status;

    if !response.is_success() {
        let (code, message) = match response.json::<ApiEnvelope<serde_json::Value>>() {
            Ok(ApiEnvelope {
                error: Some(error), ..
            }) => (Some(error.code), error.message),
            _ => (None, response.text()),
        };
        return Err(ApiError::Status {
            status: status.as_u16(),
            code,
            message,
        });
    }

    let envelope: ApiEnvelope<T> = response.json()?;
    match envelope {
        ApiEnvelope {
            status: EnvelopeStatus::Success,
            data: Some(data),
            ..
        } => Ok(data),
        ApiEnvelope {
            error: Some(error), ..
        } => Err(ApiError::Status {
            status: status.as_u16(),
            code: Some(error.code),
            message: error.message,
        }),
        _ => Err(ApiError::Decode("envelope carries no data".to_string())),
    }
}
