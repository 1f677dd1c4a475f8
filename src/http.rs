//! Authenticated REST transport.
//!
//! [`AuthenticatedTransport`] wraps a raw [`HttpExchange`] and owns the two
//! cross-cutting REST concerns: attaching the bearer credential, and the
//! uniform reaction to an authorization rejection (clear the credential,
//! fail the call with [`ParlorError::SessionInvalid`] so callers never
//! proceed as if authenticated).
//!
//! The [`HttpExchange`] trait is the testing seam — production code uses
//! [`ReqwestExchange`]; tests script responses without a network, the same
//! way the realtime side mocks [`Transport`](crate::transport::Transport).

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::error::{ParlorError, Result};
use crate::protocol::ErrorDetail;

/// HTTP methods used by the Parlor REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// One outbound REST request, fully described.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the exchange's base URL, e.g. `/sessions/me`.
    pub path: String,
    /// Bearer token to attach, if any.
    pub bearer: Option<String>,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
}

/// One inbound REST response: status plus raw body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(ParlorError::from)
    }

    /// Best-effort extraction of the server's `detail` message.
    fn detail(&self) -> String {
        serde_json::from_slice::<ErrorDetail>(&self.body)
            .map(|e| e.detail)
            .unwrap_or_else(|_| format!("request failed with status {}", self.status))
    }
}

/// A raw request/response exchange against the Parlor REST server.
///
/// Implementations perform exactly one round trip and report network-level
/// failures as [`ParlorError::Request`]; HTTP status interpretation is the
/// caller's job.
#[async_trait]
pub trait HttpExchange: Send + Sync + 'static {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpExchange`] backed by a shared [`reqwest::Client`].
pub struct ReqwestExchange {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestExchange {
    /// Create an exchange rooted at `base_url` (e.g. `https://chat.example.com`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ParlorError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ParlorError::Request(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}

/// REST transport that injects the session credential and enforces the
/// uniform 401 reaction.
#[derive(Clone)]
pub struct AuthenticatedTransport {
    exchange: Arc<dyn HttpExchange>,
    credentials: CredentialStore,
}

impl AuthenticatedTransport {
    pub fn new(exchange: Arc<dyn HttpExchange>, credentials: CredentialStore) -> Self {
        Self {
            exchange,
            credentials,
        }
    }

    /// The credential store this transport reads from (and clears on 401).
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Perform an authenticated request.
    ///
    /// The bearer header is attached when a credential is present and never
    /// otherwise. A 401 response clears the credential and fails with
    /// [`ParlorError::SessionInvalid`]. Other non-success statuses are
    /// returned as-is for the caller to interpret — no retries here.
    ///
    /// # Errors
    ///
    /// [`ParlorError::Request`] on network failure,
    /// [`ParlorError::SessionInvalid`] on authorization rejection.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        debug!(%method, path, "REST request");
        let response = self
            .exchange
            .execute(HttpRequest {
                method,
                path: path.to_string(),
                bearer: self.credentials.get(),
                body,
            })
            .await?;

        if response.status == 401 {
            warn!(path, "authorization rejected, clearing credential");
            self.credentials.clear();
            return Err(ParlorError::SessionInvalid);
        }

        Ok(response)
    }

    /// Like [`request`](Self::request), but additionally maps non-success
    /// statuses to [`ParlorError::Http`] carrying the server's detail.
    pub async fn request_expecting_success(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        let response = self.request(method, path, body).await?;
        if !response.is_success() {
            return Err(ParlorError::Http {
                status: response.status,
                detail: response.detail(),
            });
        }
        Ok(response)
    }

    /// The one unauthenticated escape hatch: no bearer header, no 401
    /// handling. Used by the room-existence probe so unauthenticated users
    /// can validate a room code before creating a session.
    pub async fn request_public(&self, method: Method, path: &str) -> Result<HttpResponse> {
        debug!(%method, path, "public REST request");
        self.exchange
            .execute(HttpRequest {
                method,
                path: path.to_string(),
                bearer: None,
                body: None,
            })
            .await
    }
}

impl std::fmt::Debug for AuthenticatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedTransport")
            .field("authenticated", &self.credentials.is_authenticated())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every request and replays scripted responses in order.
    struct ScriptedExchange {
        responses: StdMutex<std::collections::VecDeque<Result<HttpResponse>>>,
        requests: Arc<StdMutex<Vec<HttpRequest>>>,
    }

    impl ScriptedExchange {
        fn new(responses: Vec<Result<HttpResponse>>) -> (Arc<Self>, Arc<StdMutex<Vec<HttpRequest>>>) {
            let requests = Arc::new(StdMutex::new(Vec::new()));
            let exchange = Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                requests: Arc::clone(&requests),
            });
            (exchange, requests)
        }
    }

    #[async_trait]
    impl HttpExchange for ScriptedExchange {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(HttpResponse {
                    status: 200,
                    body: Vec::new(),
                }))
        }
    }

    fn ok(body: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        })
    }

    fn status(code: u16, body: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status: code,
            body: body.as_bytes().to_vec(),
        })
    }

    #[tokio::test]
    async fn bearer_attached_when_credential_present() {
        let (exchange, requests) = ScriptedExchange::new(vec![ok("{}")]);
        let credentials = CredentialStore::new();
        credentials.set("tok-42");
        let transport = AuthenticatedTransport::new(exchange, credentials);

        transport.request(Method::Get, "/rooms", None).await.unwrap();

        let recorded = requests.lock().unwrap();
        assert_eq!(recorded[0].bearer.as_deref(), Some("tok-42"));
    }

    #[tokio::test]
    async fn no_bearer_when_credential_absent() {
        let (exchange, requests) = ScriptedExchange::new(vec![ok("{}")]);
        let transport = AuthenticatedTransport::new(exchange, CredentialStore::new());

        transport.request(Method::Get, "/rooms", None).await.unwrap();

        assert!(requests.lock().unwrap()[0].bearer.is_none());
    }

    #[tokio::test]
    async fn unauthorized_clears_credential_and_fails_distinguished() {
        let (exchange, _requests) = ScriptedExchange::new(vec![status(401, "{}")]);
        let credentials = CredentialStore::new();
        credentials.set("stale");
        let transport = AuthenticatedTransport::new(exchange, credentials.clone());

        let err = transport
            .request(Method::Get, "/sessions/me", None)
            .await
            .unwrap_err();

        assert!(matches!(err, ParlorError::SessionInvalid));
        assert_eq!(credentials.get(), None);
    }

    #[tokio::test]
    async fn non_success_surfaces_server_detail() {
        let (exchange, _requests) =
            ScriptedExchange::new(vec![status(422, r#"{"detail":"username taken"}"#)]);
        let transport = AuthenticatedTransport::new(exchange, CredentialStore::new());

        let err = transport
            .request_expecting_success(Method::Post, "/sessions", None)
            .await
            .unwrap_err();

        match err {
            ParlorError::Http { status, detail } => {
                assert_eq!(status, 422);
                assert_eq!(detail, "username taken");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_without_detail_gets_generic_message() {
        let (exchange, _requests) = ScriptedExchange::new(vec![status(500, "oops")]);
        let transport = AuthenticatedTransport::new(exchange, CredentialStore::new());

        let err = transport
            .request_expecting_success(Method::Get, "/rooms", None)
            .await
            .unwrap_err();

        match err {
            ParlorError::Http { status, detail } => {
                assert_eq!(status, 500);
                assert!(detail.contains("500"));
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn public_request_skips_bearer_and_401_handling() {
        let (exchange, requests) = ScriptedExchange::new(vec![status(401, "{}")]);
        let credentials = CredentialStore::new();
        credentials.set("tok");
        let transport = AuthenticatedTransport::new(exchange, credentials.clone());

        let response = transport
            .request_public(Method::Get, "/rooms/R1")
            .await
            .unwrap();

        // The 401 is returned verbatim and the credential survives.
        assert_eq!(response.status, 401);
        assert!(requests.lock().unwrap()[0].bearer.is_none());
        assert_eq!(credentials.get().as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn network_errors_propagate() {
        let (exchange, _requests) =
            ScriptedExchange::new(vec![Err(ParlorError::Request("connection refused".into()))]);
        let transport = AuthenticatedTransport::new(exchange, CredentialStore::new());

        let err = transport
            .request(Method::Get, "/rooms", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParlorError::Request(_)));
    }
}
