use anyhow::Context;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::Credential;
use crate::error::{ApiError, Result};

/// Capability to fetch the current credential, optionally forcing a refresh
///
/// Implemented for any `Fn(bool) -> impl Future<Output = anyhow::Result<Option<Credential>>>`,
/// so a closure over "the current user" is a getter.
pub trait CredentialGetter: Send + Sync {
    fn credential(&self, force_refresh: bool) -> BoxFuture<'_, anyhow::Result<Option<Credential>>>;
}

impl<F, Fut> CredentialGetter for F
where
    F: Fn(bool) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Credential>>> + Send + 'static,
{
    fn credential(&self, force_refresh: bool) -> BoxFuture<'_, anyhow::Result<Option<Credential>>> {
        Box::pin((self)(force_refresh))
    }
}

/// Getter used while nobody is signed in
fn anonymous(_force_refresh: bool) -> future::Ready<anyhow::Result<Option<Credential>>> {
    future::ready(Ok(None))
}

/// Request body
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Structured body, serialized as JSON with a JSON content type
    Json(Value),
    /// Pre-encoded payload (multipart, binary), sent as-is
    Raw(Bytes),
}

/// One logical call as seen by application code
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<RequestBody>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn raw(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Raw response handed back to the caller, whatever its status
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Body as text (lossy UTF-8)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// HTTP client for the backend API with credential injection
///
/// Holds exactly one credential getter. `bind` replaces it wholesale; each
/// logical call captures the getter it started with and uses that same
/// getter for the forced refresh, so a swap never tears a call in two.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Backend base URL, e.g. `https://api.example.com/api`
    base_url: String,

    /// Currently registered credential getter
    getter: RwLock<Arc<dyn CredentialGetter>>,
}

impl ApiClient {
    /// Create a new client with transport defaults
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client over an existing reqwest client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let getter: Arc<dyn CredentialGetter> = Arc::new(anonymous);
        Self {
            client,
            base_url: base_url.into(),
            getter: RwLock::new(getter),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register the credential getter, replacing any previous one
    pub async fn bind<G>(&self, getter: G)
    where
        G: CredentialGetter + 'static,
    {
        let getter: Arc<dyn CredentialGetter> = Arc::new(getter);
        *self.getter.write().await = getter;
    }

    /// Drop the registered getter; subsequent calls go out unauthenticated
    pub async fn unbind(&self) {
        self.bind(anonymous).await;
    }

    /// GET `path` with credential injection
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.call(ApiRequest::get(path)).await
    }

    /// POST a JSON body to `path` with credential injection
    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<ApiResponse> {
        let request = ApiRequest::post(path);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };
        self.call(request).await
    }

    /// Execute a logical call with one credential refresh on 401
    /// Never fails on HTTP status; only transport failures and a failed initial
    /// credential lookup error
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.call_internal(request, true).await
    }

    /// Execute a logical call without the 401 retry
    pub async fn call_no_retry(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.call_internal(request, false).await
    }

    /// Execute one physical call with an explicit credential, bypassing the getter
    pub async fn call_as(&self, request: ApiRequest, credential: &Credential) -> Result<ApiResponse> {
        let url = self.url_for(&request.path);
        let body = encode_body(&request)?;
        tracing::debug!(
            method = %request.method,
            url = %url,
            credential = %credential.redacted(),
            "Sending HTTP request with explicit credential"
        );
        let req = self.build(&request, &url, body, Some(credential))?;
        self.send(req).await
    }

    async fn call_internal(&self, request: ApiRequest, retry_on_401: bool) -> Result<ApiResponse> {
        // Capture by value: a concurrent bind must not affect this call
        let getter = self.getter.read().await.clone();

        let call_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let url = self.url_for(&request.path);
        let body = encode_body(&request)?;

        let credential = getter
            .credential(false)
            .await
            .map_err(ApiError::Credential)?;

        tracing::debug!(
            call_id = %call_id,
            method = %request.method,
            url = %url,
            authenticated = credential.is_some(),
            attempt = 1,
            "Sending HTTP request"
        );

        let req = self.build(&request, &url, body.clone(), credential.as_ref())?;
        let response = self.send(req).await?;

        tracing::debug!(call_id = %call_id, status = %response.status, "Received HTTP response");

        if !response.is_unauthorized() || !retry_on_401 {
            return Ok(response);
        }

        // An unauthenticated call has nothing to refresh
        if credential.is_none() {
            tracing::debug!(call_id = %call_id, "Received 401 without a credential, not retrying");
            return Ok(response);
        }

        tracing::warn!(call_id = %call_id, url = %url, "Received 401, refreshing credential and retrying...");

        // A failed refresh leaves nothing to retry with; the 401 stands
        let refreshed = match getter.credential(true).await {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => {
                tracing::warn!(call_id = %call_id, "No credential after refresh, returning 401");
                return Ok(response);
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %format!("{:#}", e), "Credential refresh failed, returning 401");
                return Ok(response);
            }
        };

        tracing::debug!(
            call_id = %call_id,
            method = %request.method,
            url = %url,
            attempt = 2,
            "Sending HTTP request"
        );

        let req = self.build(&request, &url, body, Some(&refreshed))?;
        let response = self.send(req).await?;

        if response.is_unauthorized() {
            tracing::warn!(call_id = %call_id, url = %url, "Refreshed credential rejected with 401");
        } else {
            tracing::debug!(call_id = %call_id, status = %response.status, "Received HTTP response");
        }

        Ok(response)
    }

    fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Build one physical request
    fn build(
        &self,
        request: &ApiRequest,
        url: &str,
        body: Option<Bytes>,
        credential: Option<&Credential>,
    ) -> Result<Request> {
        let mut headers = request.headers.clone();

        if let Some(RequestBody::Json(_)) = request.body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        if let Some(credential) = credential {
            let mut value = HeaderValue::from_str(&credential.bearer()).map_err(|_| {
                ApiError::InvalidRequest("credential is not a valid header value".to_string())
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    async fn send(&self, request: Request) -> Result<ApiResponse> {
        let url = request.url().clone();

        let response = self.client.execute(request).await.map_err(|e| {
            let err = ApiError::transport(e);
            tracing::warn!(url = %url, error = %err, "HTTP request error");
            err
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(ApiError::transport)?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Serialize the body once so both attempts send identical bytes
fn encode_body(request: &ApiRequest) -> Result<Option<Bytes>> {
    match &request.body {
        None => Ok(None),
        Some(RequestBody::Json(value)) => Ok(Some(Bytes::from(serde_json::to_vec(value)?))),
        Some(RequestBody::Raw(bytes)) => Ok(Some(bytes.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> ApiClient {
        ApiClient::with_client(Client::new(), "https://api.example.com/api/")
    }

    #[test]
    fn test_url_join() {
        let client = client();
        assert_eq!(
            client.url_for("/v1/auth/me"),
            "https://api.example.com/api/v1/auth/me"
        );
        assert_eq!(
            client.url_for("v1/health"),
            "https://api.example.com/api/v1/health"
        );
    }

    #[test]
    fn test_build_without_credential_has_no_authorization() {
        let client = client();
        let request = ApiRequest::get("/v1/auth/me");
        let req = client
            .build(&request, &client.url_for(&request.path), None, None)
            .unwrap();
        assert!(req.headers().get(AUTHORIZATION).is_none());
        assert!(req.headers().get(CONTENT_TYPE).is_none());
        assert!(req.body().is_none());
    }

    #[test]
    fn test_build_json_body_sets_content_type() {
        let client = client();
        let request = ApiRequest::post("/v1/projects").json(json!({"title": "demo"}));
        let body = encode_body(&request).unwrap();
        let credential = Credential::new("tok-1");
        let req = client
            .build(&request, &client.url_for(&request.path), body, Some(&credential))
            .unwrap();

        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer tok-1");
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
        let bytes = req.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(bytes, br#"{"title":"demo"}"#);
    }

    #[test]
    fn test_build_raw_body_keeps_caller_content_type() {
        let client = client();
        let request = ApiRequest::post("/v1/uploads")
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("multipart/form-data; boundary=xyz"),
            )
            .raw(Bytes::from_static(b"--xyz--"));
        let body = encode_body(&request).unwrap();
        let req = client
            .build(&request, &client.url_for(&request.path), body, None)
            .unwrap();

        assert_eq!(
            req.headers()[CONTENT_TYPE],
            "multipart/form-data; boundary=xyz"
        );
        assert_eq!(req.body().and_then(|b| b.as_bytes()).unwrap(), b"--xyz--");
    }

    #[test]
    fn test_invalid_credential_is_rejected() {
        let client = client();
        let request = ApiRequest::get("/v1/auth/me");
        let credential = Credential::new("bad\ntoken");
        let err = client
            .build(&request, &client.url_for(&request.path), None, Some(&credential))
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_anonymous_getter_yields_none() {
        let client = client();
        let getter = client.getter.read().await.clone();
        assert!(getter.credential(false).await.unwrap().is_none());
        assert!(getter.credential(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_replaces_getter() {
        let client = client();
        client
            .bind(|_force: bool| async { Ok::<_, anyhow::Error>(Some(Credential::new("first"))) })
            .await;
        client
            .bind(|_force: bool| async { Ok::<_, anyhow::Error>(Some(Credential::new("second"))) })
            .await;

        let getter = client.getter.read().await.clone();
        let credential = getter.credential(false).await.unwrap().unwrap();
        assert_eq!(credential.as_str(), "second");

        client.unbind().await;
        let getter = client.getter.read().await.clone();
        assert!(getter.credential(false).await.unwrap().is_none());
    }

    #[test]
    fn test_response_helpers() {
        let response = ApiResponse {
            status: StatusCode::UNAUTHORIZED,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"status":"ERROR"}"#),
        };
        assert!(!response.is_success());
        assert!(response.is_unauthorized());
        assert_eq!(response.text(), r#"{"status":"ERROR"}"#);
        let value: Value = response.json().unwrap();
        assert_eq!(value["status"], "ERROR");
        assert!(matches!(
            response.json::<Vec<u8>>(),
            Err(ApiError::Decode(_))
        ));
    }
}
