// Identity provider contract consumed by the session bridge

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use super::types::Principal;

/// Identity provider (credential source)
///
/// The change stream is a `watch` channel: a fresh receiver always observes
/// the current principal first, so subscribers get one emission at startup
/// even when nobody is signed in. Implementations must not re-send the same
/// principal (no duplicate emissions per transition).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Subscribe to sign-in state changes
    fn subscribe(&self) -> watch::Receiver<Option<Principal>>;

    /// Sign in through the provider's federated flow
    async fn sign_in_with_provider(&self) -> Result<Principal>;

    /// Sign in with an identifier and secret (email/password)
    async fn sign_in_with_credentials(&self, id: &str, secret: &str) -> Result<Principal>;

    /// Create a new account and sign it in
    async fn sign_up_with_credentials(&self, id: &str, secret: &str) -> Result<Principal>;

    /// Sign the current principal out
    async fn sign_out(&self) -> Result<()>;
}
