// Authentication types

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque bearer token issued by the identity provider
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    /// Short prefix safe to put in logs
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{}...", prefix)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Issues credentials for one signed-in principal
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a valid id token, refreshing with the provider when forced or stale
    async fn id_token(&self, force_refresh: bool) -> Result<Credential>;
}

/// A signed-in principal as reported by the identity provider
///
/// Cloning is cheap; every clone shares the same token source, so a clone
/// captured by an in-flight request keeps asking the same user for tokens.
#[derive(Clone)]
pub struct Principal {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    tokens: Arc<dyn TokenSource>,
}

impl Principal {
    pub fn new(
        uid: impl Into<String>,
        email: Option<String>,
        display_name: Option<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            uid: uid.into(),
            email,
            display_name,
            tokens,
        }
    }

    /// Current credential of this principal
    pub async fn credential(&self, force_refresh: bool) -> Result<Credential> {
        self.tokens.id_token(force_refresh).await
    }

    /// Both handles come from the same sign-in (shared token source)
    pub fn same_session(&self, other: &Principal) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.tokens) as *const (),
            Arc::as_ptr(&other.tokens) as *const (),
        )
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Token data held for a signed-in user
#[derive(Debug, Clone)]
pub struct TokenData {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Email/password request for `accounts:signInWithPassword` and `accounts:signUp`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub return_secure_token: bool,
}

/// Federated request for `accounts:signInWithIdp`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdpRequest {
    pub post_body: String,
    pub request_uri: String,
    pub return_secure_token: bool,
    pub return_idp_credential: bool,
}

/// Identity toolkit sign-in/sign-up response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_in: Option<String>,
    pub local_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Securetoken refresh response
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<String>,
}

/// Error body shared by identity toolkit and securetoken
#[derive(Deserialize)]
pub struct ProviderErrorBody {
    pub error: ProviderErrorDetail,
}

#[derive(Deserialize)]
pub struct ProviderErrorDetail {
    pub message: String,
}
