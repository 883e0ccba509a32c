// Firebase identity provider adapter

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::watch;

use super::manager::TokenManager;
use super::provider::IdentityProvider;
use super::refresh::{self, ProviderEndpoints, SignedIn};
use super::types::Principal;

/// Provider id token obtained out of band (e.g. a Google OAuth flow)
#[derive(Debug, Clone)]
pub struct FederatedToken {
    pub provider_id: String,
    pub id_token: String,
}

/// Identity provider backed by the Firebase Identity Toolkit REST API
pub struct FirebaseIdentity {
    client: Client,
    endpoints: Arc<ProviderEndpoints>,
    refresh_threshold: u64,
    federated: Option<FederatedToken>,
    current: watch::Sender<Option<Principal>>,
}

impl FirebaseIdentity {
    /// Create a provider with no restored session
    pub fn new(client: Client, endpoints: ProviderEndpoints, refresh_threshold: u64) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            client,
            endpoints: Arc::new(endpoints),
            refresh_threshold,
            federated: None,
            current,
        }
    }

    /// Use this provider token for `sign_in_with_provider`
    pub fn with_federated_token(mut self, token: FederatedToken) -> Self {
        self.federated = Some(token);
        self
    }

    fn principal_from(&self, signed_in: SignedIn) -> Principal {
        let tokens = TokenManager::new(
            signed_in.tokens,
            self.client.clone(),
            self.endpoints.clone(),
            self.refresh_threshold,
        );
        Principal::new(
            signed_in.uid,
            signed_in.email,
            signed_in.display_name,
            Arc::new(tokens),
        )
    }

    /// Publish a sign-in state transition, skipping non-transitions
    fn emit(&self, next: Option<Principal>) {
        let changed = self.current.send_if_modified(|current| {
            let changed = match (current.as_ref(), next.as_ref()) {
                (None, None) => false,
                (Some(a), Some(b)) => !a.same_session(b),
                _ => true,
            };
            if changed {
                *current = next.clone();
            }
            changed
        });

        if changed {
            match next {
                Some(ref p) => tracing::info!(uid = %p.uid, "Identity state changed: signed in"),
                None => tracing::info!("Identity state changed: signed out"),
            }
        }
    }

    fn signed_in(&self, signed_in: SignedIn) -> Principal {
        let principal = self.principal_from(signed_in);
        self.emit(Some(principal.clone()));
        principal
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentity {
    fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.current.subscribe()
    }

    async fn sign_in_with_provider(&self) -> Result<Principal> {
        let federated = self
            .federated
            .as_ref()
            .context("Federated sign-in requires a provider id token")?;

        let signed_in = refresh::sign_in_with_idp(
            &self.client,
            &self.endpoints,
            &federated.provider_id,
            &federated.id_token,
        )
        .await?;

        Ok(self.signed_in(signed_in))
    }

    async fn sign_in_with_credentials(&self, id: &str, secret: &str) -> Result<Principal> {
        let signed_in =
            refresh::sign_in_with_password(&self.client, &self.endpoints, id, secret).await?;
        Ok(self.signed_in(signed_in))
    }

    async fn sign_up_with_credentials(&self, id: &str, secret: &str) -> Result<Principal> {
        let signed_in = refresh::sign_up(&self.client, &self.endpoints, id, secret).await?;
        Ok(self.signed_in(signed_in))
    }

    async fn sign_out(&self) -> Result<()> {
        // Tokens are bearer-only; nothing to revoke server side
        self.emit(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn identity_for(server: &mockito::Server) -> FirebaseIdentity {
        let mut endpoints = ProviderEndpoints::new("test-key");
        endpoints.identity_endpoint = server.url();
        endpoints.token_endpoint = server.url();
        FirebaseIdentity::new(Client::new(), endpoints, 300)
    }

    fn sign_in_body(uid: &str, token: &str) -> String {
        json!({
            "idToken": token,
            "refreshToken": format!("refresh-{uid}"),
            "expiresIn": "3600",
            "localId": uid,
            "email": format!("{uid}@x.com"),
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_startup_emits_signed_out() {
        let server = mockito::Server::new_async().await;
        let identity = identity_for(&server);
        let rx = identity.subscribe();
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_with_credentials_emits_principal() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/accounts:signInWithPassword")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .match_body(Matcher::Json(json!({
                "email": "a@x.com",
                "password": "secret1",
                "returnSecureToken": true,
            })))
            .with_status(200)
            .with_body(sign_in_body("a", "token-a"))
            .expect(1)
            .create_async()
            .await;

        let identity = identity_for(&server);
        let mut rx = identity.subscribe();

        let principal = identity
            .sign_in_with_credentials("a@x.com", "secret1")
            .await
            .unwrap();
        assert_eq!(principal.uid, "a");
        assert_eq!(principal.email.as_deref(), Some("a@x.com"));
        assert_eq!(principal.credential(false).await.unwrap().as_str(), "token-a");

        assert!(rx.has_changed().unwrap());
        let emitted = rx.borrow_and_update().clone().unwrap();
        assert!(emitted.same_session(&principal));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sign_out_emits_once() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/accounts:signUp")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(sign_in_body("b", "token-b"))
            .create_async()
            .await;

        let identity = identity_for(&server);
        identity
            .sign_up_with_credentials("b@x.com", "secret2")
            .await
            .unwrap();

        let mut rx = identity.subscribe();
        rx.borrow_and_update();

        identity.sign_out().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());

        // Already signed out: no duplicate emission
        identity.sign_out().await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_sign_in_failure_is_readable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/accounts:signInWithPassword")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"INVALID_LOGIN_CREDENTIALS"}}"#)
            .create_async()
            .await;

        let identity = identity_for(&server);
        let rx = identity.subscribe();
        let err = identity
            .sign_in_with_credentials("a@x.com", "wrong")
            .await
            .unwrap_err();
        assert_eq!(
            format!("{:#}", err),
            "Sign-in failed: Invalid email or password."
        );
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_federated_sign_in() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/accounts:signInWithIdp")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "postBody": "id_token=google-jwt&providerId=google.com",
                "returnSecureToken": true,
            })))
            .with_status(200)
            .with_body(sign_in_body("g", "token-g"))
            .create_async()
            .await;

        let identity = identity_for(&server).with_federated_token(FederatedToken {
            provider_id: "google.com".to_string(),
            id_token: "google-jwt".to_string(),
        });
        let principal = identity.sign_in_with_provider().await.unwrap();
        assert_eq!(principal.uid, "g");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_federated_sign_in_without_token() {
        let server = mockito::Server::new_async().await;
        let identity = identity_for(&server);
        let err = identity.sign_in_with_provider().await.unwrap_err();
        assert!(err.to_string().contains("provider id token"));
    }
}
