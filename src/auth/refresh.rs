// Identity toolkit and securetoken round trips

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};

use super::types::{
    IdpRequest, PasswordRequest, ProviderErrorBody, RefreshResponse, SignInResponse, TokenData,
};

/// Default identity toolkit host
pub const DEFAULT_IDENTITY_ENDPOINT: &str = "https://identitytoolkit.googleapis.com";

/// Default securetoken host
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://securetoken.googleapis.com";

/// Where and how to reach the identity provider
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub api_key: String,
    pub identity_endpoint: String,
    pub token_endpoint: String,
}

impl ProviderEndpoints {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            identity_endpoint: DEFAULT_IDENTITY_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
        }
    }

    fn accounts_url(&self, action: &str) -> String {
        format!(
            "{}/v1/accounts:{}?key={}",
            self.identity_endpoint.trim_end_matches('/'),
            action,
            self.api_key
        )
    }

    fn token_url(&self) -> String {
        format!(
            "{}/v1/token?key={}",
            self.token_endpoint.trim_end_matches('/'),
            self.api_key
        )
    }
}

/// Outcome of a successful sign-in or sign-up
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub tokens: TokenData,
}

impl From<SignInResponse> for SignedIn {
    fn from(data: SignInResponse) -> Self {
        Self {
            uid: data.local_id,
            email: data.email,
            display_name: data.display_name,
            tokens: TokenData {
                id_token: data.id_token,
                refresh_token: data.refresh_token,
                expires_at: expires_at_from(data.expires_in.as_deref()),
            },
        }
    }
}

/// Sign in with email and password
pub async fn sign_in_with_password(
    client: &Client,
    endpoints: &ProviderEndpoints,
    email: &str,
    password: &str,
) -> Result<SignedIn> {
    tracing::info!("Signing in with email and password...");

    let request = PasswordRequest {
        email,
        password,
        return_secure_token: true,
    };
    let data: SignInResponse =
        post_json(client, &endpoints.accounts_url("signInWithPassword"), &request)
            .await
            .context("Sign-in failed")?;

    Ok(data.into())
}

/// Create an account with email and password
pub async fn sign_up(
    client: &Client,
    endpoints: &ProviderEndpoints,
    email: &str,
    password: &str,
) -> Result<SignedIn> {
    tracing::info!("Creating account with email and password...");

    let request = PasswordRequest {
        email,
        password,
        return_secure_token: true,
    };
    let data: SignInResponse = post_json(client, &endpoints.accounts_url("signUp"), &request)
        .await
        .context("Sign-up failed")?;

    Ok(data.into())
}

/// Exchange a federated provider id token (e.g. Google) for a session
pub async fn sign_in_with_idp(
    client: &Client,
    endpoints: &ProviderEndpoints,
    provider_id: &str,
    provider_id_token: &str,
) -> Result<SignedIn> {
    tracing::info!(provider_id = provider_id, "Signing in with federated provider...");

    let request = IdpRequest {
        post_body: idp_post_body(provider_id, provider_id_token)?,
        request_uri: "http://localhost".to_string(),
        return_secure_token: true,
        return_idp_credential: true,
    };
    let data: SignInResponse = post_json(client, &endpoints.accounts_url("signInWithIdp"), &request)
        .await
        .context("Federated sign-in failed")?;

    Ok(data.into())
}

/// Trade a refresh token for a new id token
pub async fn refresh_id_token(
    client: &Client,
    endpoints: &ProviderEndpoints,
    refresh_token: &str,
) -> Result<TokenData> {
    tracing::debug!("Refreshing id token via securetoken...");

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(endpoints.token_url())
        .form(&form)
        .send()
        .await
        .context("Failed to send token refresh request")?;

    let data: RefreshResponse = read_json(response)
        .await
        .context("Token refresh failed")?;

    if data.id_token.is_empty() {
        anyhow::bail!("Token refresh response does not contain id_token");
    }

    let expires_at = expires_at_from(data.expires_in.as_deref());
    tracing::info!("Id token refreshed, expires: {}", expires_at.to_rfc3339());

    Ok(TokenData {
        id_token: data.id_token,
        refresh_token: data
            .refresh_token
            .unwrap_or_else(|| refresh_token.to_string()),
        expires_at,
    })
}

/// Form-encoded `postBody` carrying the provider's id token
fn idp_post_body(provider_id: &str, provider_id_token: &str) -> Result<String> {
    serde_urlencoded::to_string([("id_token", provider_id_token), ("providerId", provider_id)])
        .context("Failed to encode federated sign-in request")
}

async fn post_json<B: Serialize, T: DeserializeOwned>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<T> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("Failed to reach identity provider")?;

    read_json(response).await
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %error_text, "Identity provider error response");
        anyhow::bail!("{}", describe_provider_error(&error_text));
    }

    response
        .json()
        .await
        .context("Failed to parse identity provider response")
}

/// Turn a provider error body into a readable message
pub fn describe_provider_error(body: &str) -> String {
    let raw = serde_json::from_str::<ProviderErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    // Messages look like "WEAK_PASSWORD : Password should be at least 6 characters"
    let code = raw.split(" : ").next().unwrap_or_default().trim();

    match code {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => {
            "Invalid email or password.".to_string()
        }
        "EMAIL_EXISTS" => "An account already exists for this email.".to_string(),
        "WEAK_PASSWORD" => "Password is too weak.".to_string(),
        "INVALID_EMAIL" => "Email address is malformed.".to_string(),
        "USER_DISABLED" => "This account has been disabled.".to_string(),
        "TOO_MANY_ATTEMPTS_TRY_LATER" => "Too many attempts, try again later.".to_string(),
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "USER_NOT_FOUND" => {
            "Session expired, sign in again.".to_string()
        }
        "" => "Identity provider request failed.".to_string(),
        _ => raw,
    }
}

/// Expiry from an `expires_in` seconds string, minus a 60 second buffer
/// (never earlier than now)
fn expires_at_from(expires_in: Option<&str>) -> DateTime<Utc> {
    let seconds = expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(3600);
    Utc::now() + Duration::seconds((seconds - 60).max(0))
}
