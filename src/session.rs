// Session bridge
// Mirrors identity provider state and keeps the API client's credential getter current

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{Credential, IdentityProvider, Principal};
use crate::backend::BackendApi;
use crate::error::SessionError;
use crate::http_client::ApiClient;

/// Who is signed in, as far as the application knows
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// The provider has not reported yet
    Loading,
    SignedOut,
    SignedIn(Principal),
}

/// Snapshot published to readers; replaced as a whole on every change
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Last operation failure, kept until cleared or the next operation
    pub error: Option<String>,
}

impl SessionState {
    pub fn user(&self) -> Option<&Principal> {
        match &self.status {
            SessionStatus::SignedIn(principal) => Some(principal),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.status, SessionStatus::Loading)
    }
}

/// Bridges identity provider change events into session state and the API client
pub struct SessionBridge {
    provider: Arc<dyn IdentityProvider>,
    backend: BackendApi,
    state: watch::Sender<SessionState>,

    /// Serializes provider reads, getter rebinding and state publication
    apply_lock: tokio::sync::Mutex<()>,

    /// Change-stream subscription task
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBridge {
    /// Subscribe to the provider and start mirroring its state
    pub fn start(provider: Arc<dyn IdentityProvider>, backend: BackendApi) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState {
            status: SessionStatus::Loading,
            error: None,
        });

        let bridge = Arc::new(Self {
            provider,
            backend,
            state,
            apply_lock: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        });

        let mut changes = bridge.provider.subscribe();
        let weak = Arc::downgrade(&bridge);
        let handle = tokio::spawn(async move {
            loop {
                changes.borrow_and_update();
                match weak.upgrade() {
                    Some(bridge) => bridge.sync_with_provider().await,
                    None => break,
                }
                if changes.changed().await.is_err() {
                    tracing::debug!("Identity provider closed its change stream");
                    break;
                }
            }
        });

        if let Ok(mut listener) = bridge.listener.lock() {
            *listener = Some(handle);
        }

        bridge
    }

    /// Current snapshot
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch session changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the provider's first report has been applied
    pub async fn wait_resolved(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let resolved = rx.wait_for(|state| !state.is_loading()).await;
        match resolved {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    pub fn api(&self) -> &BackendApi {
        &self.backend
    }

    /// Credential of the current session, `None` when signed out
    pub async fn current_credential(&self, force_refresh: bool) -> anyhow::Result<Option<Credential>> {
        let user = self.state.borrow().user().cloned();
        match user {
            Some(principal) => principal.credential(force_refresh).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn sign_in_with_provider(&self) -> Result<Principal, SessionError> {
        self.run_sign_in("Sign-in failed.", self.provider.sign_in_with_provider())
            .await
    }

    pub async fn sign_in_with_credentials(
        &self,
        id: &str,
        secret: &str,
    ) -> Result<Principal, SessionError> {
        self.run_sign_in(
            "Sign-in failed.",
            self.provider.sign_in_with_credentials(id, secret),
        )
        .await
    }

    pub async fn sign_up_with_credentials(
        &self,
        id: &str,
        secret: &str,
    ) -> Result<Principal, SessionError> {
        self.run_sign_in(
            "Sign-up failed.",
            self.provider.sign_up_with_credentials(id, secret),
        )
        .await
    }

    pub async fn sign_out(&self) -> Result<(), SessionError> {
        self.clear_error();

        if let Err(source) = self.provider.sign_out().await {
            let err = SessionError::Provider {
                message: provider_message(&source, "Sign-out failed."),
                source,
            };
            self.record_error(&err);
            return Err(err);
        }

        self.sync_with_provider().await;
        Ok(())
    }

    pub fn clear_error(&self) {
        self.state.send_if_modified(|state| state.error.take().is_some());
    }

    /// Stop listening to the provider
    pub fn shutdown(&self) {
        let handle = self.listener.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("Session bridge unsubscribed from identity provider");
        }
    }

    async fn run_sign_in<F>(&self, fallback: &str, operation: F) -> Result<Principal, SessionError>
    where
        F: Future<Output = anyhow::Result<Principal>>,
    {
        self.clear_error();

        let result = self.complete_sign_in(fallback, operation).await;
        if let Err(ref err) = result {
            self.record_error(err);
        }
        result
    }

    async fn complete_sign_in<F>(&self, fallback: &str, operation: F) -> Result<Principal, SessionError>
    where
        F: Future<Output = anyhow::Result<Principal>>,
    {
        let principal = operation.await.map_err(|source| SessionError::Provider {
            message: provider_message(&source, fallback),
            source,
        })?;

        // Local state follows the provider right away, even if registration fails below
        self.sync_with_provider().await;

        let id_token = principal
            .credential(false)
            .await
            .map_err(|source| SessionError::Provider {
                message: fallback.to_string(),
                source,
            })?;

        self.backend
            .register_session(&id_token)
            .await
            .map_err(|source| SessionError::Registration { source })?;

        Ok(principal)
    }

    fn record_error(&self, err: &SessionError) {
        let message = err.user_message();
        tracing::warn!(error = %message, "Session operation failed");
        self.state.send_modify(|state| state.error = Some(message));
    }

    /// Replace the session with the provider's latest report and rebind the
    /// client's credential getter
    ///
    /// The value is read under the lock, so a slow listener can never
    /// overwrite a newer state with an older emission.
    async fn sync_with_provider(&self) {
        let _guard = self.apply_lock.lock().await;
        let next = self.provider.subscribe().borrow().clone();

        let unchanged = {
            let current = self.state.borrow();
            match (&current.status, next.as_ref()) {
                (SessionStatus::SignedIn(a), Some(b)) => a.same_session(b),
                (SessionStatus::SignedOut, None) => true,
                _ => false,
            }
        };
        if unchanged {
            return;
        }

        let client: &ApiClient = self.backend.client();
        let status = match next {
            Some(principal) => {
                tracing::info!(uid = %principal.uid, "Session signed in");
                let bound = principal.clone();
                client
                    .bind(move |force_refresh: bool| {
                        let principal = bound.clone();
                        async move { principal.credential(force_refresh).await.map(Some) }
                    })
                    .await;
                SessionStatus::SignedIn(principal)
            }
            None => {
                tracing::info!("Session signed out");
                client.unbind().await;
                SessionStatus::SignedOut
            }
        };

        self.state.send_modify(|state| state.status = status);
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Message shown for a failed provider operation
fn provider_message(source: &anyhow::Error, fallback: &str) -> String {
    let message = format!("{:#}", source);
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
