use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::refresh::{self, ProviderEndpoints};
use super::types::{Credential, TokenData, TokenSource};

/// Token manager for one signed-in user
/// Caches the id token and refreshes it on demand or when it is about to expire
pub struct TokenManager {
    /// Current token data
    tokens: Arc<RwLock<TokenData>>,

    /// HTTP client for refresh requests
    client: Client,

    /// Provider endpoints and API key
    endpoints: Arc<ProviderEndpoints>,

    /// Token refresh threshold in seconds (default: 300 = 5 minutes)
    refresh_threshold: i64,

    /// One refresh round trip at a time per user
    refresh_gate: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        tokens: TokenData,
        client: Client,
        endpoints: Arc<ProviderEndpoints>,
        refresh_threshold: u64,
    ) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(tokens)),
            client,
            endpoints,
            refresh_threshold: refresh_threshold as i64,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Check if token is expiring soon (within threshold)
    async fn is_token_expiring_soon(&self) -> bool {
        let tokens = self.tokens.read().await;
        let threshold = Utc::now() + Duration::seconds(self.refresh_threshold);
        tokens.expires_at <= threshold
    }

    /// Check if token is actually expired (not just expiring soon)
    async fn is_token_expired(&self) -> bool {
        let tokens = self.tokens.read().await;
        Utc::now() >= tokens.expires_at
    }

    /// Refresh the id token
    /// The token lock is never held across the round trip, so cached reads
    /// stay fast while a refresh is pending
    async fn refresh_token(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        let refresh_token = self.tokens.read().await.refresh_token.clone();
        let refreshed =
            refresh::refresh_id_token(&self.client, &self.endpoints, &refresh_token).await?;

        *self.tokens.write().await = refreshed;
        Ok(())
    }

    async fn cached_token(&self) -> Credential {
        let tokens = self.tokens.read().await;
        Credential::new(tokens.id_token.clone())
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn id_token(&self, force_refresh: bool) -> Result<Credential> {
        if force_refresh {
            self.refresh_token()
                .await
                .context("Forced token refresh failed")?;
            return Ok(self.cached_token().await);
        }

        if self.is_token_expiring_soon().await {
            if let Err(e) = self.refresh_token().await {
                tracing::error!("Token refresh failed: {:#}", e);

                // Graceful degradation: if token isn't actually expired yet, use it
                if !self.is_token_expired().await {
                    tracing::warn!(
                        "Using existing token despite refresh failure (not yet expired)"
                    );
                    return Ok(self.cached_token().await);
                }

                return Err(e).context("Failed to refresh token and no valid token available");
            }
        }

        Ok(self.cached_token().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(expires_in_secs: i64, token_endpoint: &str) -> TokenManager {
        let mut endpoints = ProviderEndpoints::new("test-key");
        endpoints.token_endpoint = token_endpoint.to_string();
        TokenManager::new(
            TokenData {
                id_token: "cached-token".to_string(),
                refresh_token: "refresh-1".to_string(),
                expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            },
            Client::new(),
            Arc::new(endpoints),
            300,
        )
    }

    #[tokio::test]
    async fn test_token_expiration_check() {
        // Token expires in 10 minutes, threshold is 5 minutes - should not need refresh
        let manager = manager_with(600, "http://127.0.0.1:9");
        assert!(!manager.is_token_expiring_soon().await);

        // Update to expire in 2 minutes - should need refresh
        {
            let mut tokens = manager.tokens.write().await;
            tokens.expires_at = Utc::now() + Duration::seconds(120);
        }
        assert!(manager.is_token_expiring_soon().await);
        assert!(!manager.is_token_expired().await);
    }

    #[tokio::test]
    async fn test_token_expired_check() {
        let manager = manager_with(-60, "http://127.0.0.1:9");
        assert!(manager.is_token_expired().await);
    }

    #[tokio::test]
    async fn test_fresh_token_served_from_cache() {
        // Refresh endpoint is unreachable; a fresh token must not need it
        let manager = manager_with(3600, "http://127.0.0.1:9");
        let token = manager.id_token(false).await.unwrap();
        assert_eq!(token.as_str(), "cached-token");
    }

    #[tokio::test]
    async fn test_forced_refresh_replaces_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/token")
            .match_query(mockito::Matcher::UrlEncoded(
                "key".into(),
                "test-key".into(),
            ))
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id_token":"fresh-token","refresh_token":"refresh-2","expires_in":"3600","user_id":"u1"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let manager = manager_with(3600, &server.url());
        let token = manager.id_token(true).await.unwrap();
        assert_eq!(token.as_str(), "fresh-token");
        assert_eq!(manager.tokens.read().await.refresh_token, "refresh-2");

        // Cached afterwards
        let token = manager.id_token(false).await.unwrap();
        assert_eq!(token.as_str(), "fresh-token");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_unexpired_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/token")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"TOKEN_EXPIRED"}}"#)
            .create_async()
            .await;

        // Within threshold but not expired
        let manager = manager_with(120, &server.url());
        let token = manager.id_token(false).await.unwrap();
        assert_eq!(token.as_str(), "cached-token");

        // Forced refresh has no fallback
        let err = manager.id_token(true).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Session expired"));
    }

    #[tokio::test]
    async fn test_cached_read_not_blocked_by_pending_refresh() {
        // Token endpoint that accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stalled = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let manager = Arc::new(manager_with(3600, &format!("http://{}", addr)));
        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.id_token(true).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let token = tokio::time::timeout(std::time::Duration::from_secs(2), manager.id_token(false))
            .await
            .expect("cached read blocked behind refresh")
            .unwrap();
        assert_eq!(token.as_str(), "cached-token");
        assert!(!pending.is_finished());

        pending.abort();
        stalled.abort();
    }

    #[tokio::test]
    async fn test_failed_refresh_with_expired_token_errors() {
        let manager = manager_with(-10, "http://127.0.0.1:9");
        assert!(manager.id_token(false).await.is_err());
    }
}
