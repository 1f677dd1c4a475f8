//! Session and room directory over the Parlor REST surface.
//!
//! [`SessionDirectory`] owns the logical session record and room
//! membership: creating/fetching/destroying the session, joining and
//! leaving rooms, and snapshot fetches (message history, joined-room
//! list). Everything delegates to
//! [`AuthenticatedTransport`](crate::http::AuthenticatedTransport); this
//! layer only knows endpoints and payload shapes.

use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ParlorError, Result};
use crate::http::{AuthenticatedTransport, Method};
use crate::protocol::{
    Message, MessageHistory, RoomCreated, RoomId, RoomList, SessionCreated, SessionInfo,
};

/// The authenticated user's view of their session.
#[derive(Debug, Clone)]
pub struct Session {
    /// The session credential (also held by the shared
    /// [`CredentialStore`](crate::credentials::CredentialStore)).
    pub credential: String,
    pub username: String,
    /// Authoritative membership snapshot. Refreshed only by explicit
    /// re-fetch, never incrementally from realtime events.
    pub joined_rooms: Vec<RoomId>,
}

/// REST-backed directory of sessions and rooms.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    transport: AuthenticatedTransport,
}

impl SessionDirectory {
    pub fn new(transport: AuthenticatedTransport) -> Self {
        Self { transport }
    }

    /// The underlying transport (shared credential store lives there).
    pub fn transport(&self) -> &AuthenticatedTransport {
        &self.transport
    }

    /// Create a session for `username` and store its credential.
    ///
    /// # Errors
    ///
    /// [`ParlorError::Validation`] when the server rejects the username
    /// (4xx with a detail message); transport errors otherwise.
    pub async fn create_session(&self, username: &str) -> Result<Session> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ParlorError::Validation {
                message: "username must not be empty".into(),
            });
        }

        let response = match self
            .transport
            .request_expecting_success(
                Method::Post,
                "/sessions",
                Some(json!({ "username": username })),
            )
            .await
        {
            Ok(response) => response,
            // Client errors carry the server's rejection of the input;
            // anything else (outage, transport) is not a validation
            // problem and propagates as-is.
            Err(ParlorError::Http { status, detail }) if (400..500).contains(&status) => {
                return Err(ParlorError::Validation { message: detail });
            }
            Err(e) => return Err(e),
        };

        let created: SessionCreated = response.json()?;
        self.transport.credentials().set(&created.session_id);
        debug!(username = %created.username, "session created");

        Ok(Session {
            credential: created.session_id,
            username: created.username,
            joined_rooms: created.joined_rooms,
        })
    }

    /// Fetch the current session record.
    ///
    /// # Errors
    ///
    /// [`ParlorError::SessionInvalid`] when the credential is absent or
    /// rejected by the server.
    pub async fn current_session(&self) -> Result<Session> {
        let Some(credential) = self.transport.credentials().get() else {
            return Err(ParlorError::SessionInvalid);
        };

        let response = self
            .transport
            .request_expecting_success(Method::Get, "/sessions/me", None)
            .await?;
        let info: SessionInfo = response.json()?;

        Ok(Session {
            credential,
            username: info.username,
            joined_rooms: info.joined_rooms,
        })
    }

    /// Destroy the session server-side. Best-effort: the local credential
    /// is cleared regardless of the server's answer.
    pub async fn destroy_session(&self) -> Result<()> {
        let outcome = self
            .transport
            .request(Method::Delete, "/sessions/me", None)
            .await;
        self.transport.credentials().clear();

        match outcome {
            Ok(_) => Ok(()),
            Err(ParlorError::SessionInvalid) => Ok(()), // already gone server-side
            Err(e) => {
                warn!(error = %e, "session teardown failed server-side");
                Err(e)
            }
        }
    }

    /// Create a new room and return its id.
    pub async fn create_room(&self) -> Result<RoomId> {
        let response = self
            .transport
            .request_expecting_success(Method::Post, "/rooms", None)
            .await?;
        let created: RoomCreated = response.json()?;
        Ok(created.room_id)
    }

    /// Fetch the joined-room list snapshot.
    pub async fn list_joined_rooms(&self) -> Result<Vec<RoomId>> {
        let response = self
            .transport
            .request_expecting_success(Method::Get, "/rooms", None)
            .await?;
        let list: RoomList = response.json()?;
        Ok(list.rooms)
    }

    /// Join `room_id`. The server treats re-joining as success; transport
    /// errors propagate.
    pub async fn join_room(&self, room_id: &str) -> Result<()> {
        self.transport
            .request_expecting_success(Method::Post, &format!("/rooms/{room_id}/join"), None)
            .await?;
        Ok(())
    }

    /// Leave `room_id`. Leaving an already-left room is not a hard
    /// failure from the orchestrator's point of view; transport errors
    /// propagate.
    pub async fn leave_room(&self, room_id: &str) -> Result<()> {
        self.transport
            .request_expecting_success(Method::Delete, &format!("/rooms/{room_id}/leave"), None)
            .await?;
        Ok(())
    }

    /// Fetch up to `limit` messages of room history.
    ///
    /// This is a snapshot, not a live subscription, and no ordering is
    /// assumed — the synchronizer normalizes to chronological order.
    pub async fn fetch_history(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let response = self
            .transport
            .request_expecting_success(
                Method::Get,
                &format!("/rooms/{room_id}/messages?limit={limit}"),
                None,
            )
            .await?;
        let history: MessageHistory = response.json()?;
        Ok(history.messages)
    }

    /// Probe whether `room_id` exists. Unauthenticated, and fails closed:
    /// a negative answer and a network failure both yield `false`, so UI
    /// flows can branch on the boolean safely.
    pub async fn room_exists(&self, room_id: &str) -> bool {
        match self
            .transport
            .request_public(Method::Get, &format!("/rooms/{room_id}"))
            .await
        {
            Ok(response) => response.is_success(),
            Err(e) => {
                warn!(room_id, error = %e, "room existence probe failed, treating as absent");
                false
            }
        }
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
    use crate::credentials::CredentialStore;
    use crate::http::{HttpExchange, HttpRequest, HttpResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    struct ScriptedExchange {
        responses: StdMutex<VecDeque<Result<HttpResponse>>>,
        requests: Arc<StdMutex<Vec<HttpRequest>>>,
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
                    body: b"{}".to_vec(),
                }))
        }
    }

    fn directory_with(
        responses: Vec<Result<HttpResponse>>,
    ) -> (SessionDirectory, Arc<StdMutex<Vec<HttpRequest>>>, CredentialStore) {
        let requests = Arc::new(StdMutex::new(Vec::new()));
        let exchange = Arc::new(ScriptedExchange {
            responses: StdMutex::new(responses.into()),
            requests: Arc::clone(&requests),
        });
        let credentials = CredentialStore::new();
        let transport = AuthenticatedTransport::new(exchange, credentials.clone());
        (SessionDirectory::new(transport), requests, credentials)
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
    async fn create_session_stores_credential() {
        let (directory, requests, credentials) = directory_with(vec![ok(
            r#"{"session_id":"s-77","username":"alice","joined_rooms":[]}"#,
        )]);

        let session = directory.create_session("alice").await.unwrap();

        assert_eq!(session.username, "alice");
        assert_eq!(session.credential, "s-77");
        assert_eq!(credentials.get().as_deref(), Some("s-77"));
        assert_eq!(requests.lock().unwrap()[0].path, "/sessions");
    }

    #[tokio::test]
    async fn create_session_rejects_empty_username_locally() {
        let (directory, requests, _credentials) = directory_with(vec![]);
        let err = directory.create_session("   ").await.unwrap_err();
        assert!(matches!(err, ParlorError::Validation { .. }));
        assert!(requests.lock().unwrap().is_empty(), "no request expected");
    }

    #[tokio::test]
    async fn create_session_maps_server_rejection_to_validation() {
        let (directory, _requests, credentials) =
            directory_with(vec![status(422, r#"{"detail":"username taken"}"#)]);

        let err = directory.create_session("alice").await.unwrap_err();

        match err {
            ParlorError::Validation { message } => assert_eq!(message, "username taken"),
            other => panic!("expected Validation, got {other:?}"),
        }
        assert_eq!(credentials.get(), None);
    }

    #[tokio::test]
    async fn create_session_surfaces_server_outage_as_http_error() {
        let (directory, _requests, credentials) = directory_with(vec![status(503, "")]);

        let err = directory.create_session("alice").await.unwrap_err();

        // A 5xx is not a user-input problem and must not read like one.
        match err {
            ParlorError::Http { status, .. } => assert_eq!(status, 503),
            other => panic!("expected Http error, got {other:?}"),
        }
        assert_eq!(credentials.get(), None);
    }

    #[tokio::test]
    async fn current_session_fails_fast_without_credential() {
        let (directory, requests, _credentials) = directory_with(vec![]);
        let err = directory.current_session().await.unwrap_err();
        assert!(matches!(err, ParlorError::SessionInvalid));
        assert!(requests.lock().unwrap().is_empty(), "no network call expected");
    }

    #[tokio::test]
    async fn current_session_parses_membership_snapshot() {
        let (directory, _requests, credentials) =
            directory_with(vec![ok(r#"{"username":"bob","joined_rooms":["R1","R2"]}"#)]);
        credentials.set("tok");

        let session = directory.current_session().await.unwrap();
        assert_eq!(session.username, "bob");
        assert_eq!(session.joined_rooms, vec!["R1".to_string(), "R2".to_string()]);
    }

    #[tokio::test]
    async fn destroy_session_clears_credential_even_on_server_error() {
        let (directory, _requests, credentials) = directory_with(vec![status(500, "")]);
        credentials.set("tok");

        // Server-side failure still propagates...
        let _ = directory.destroy_session().await;
        // ...but the local credential is gone regardless.
        assert_eq!(credentials.get(), None);
    }

    #[tokio::test]
    async fn destroy_session_tolerates_rejected_credential() {
        let (directory, _requests, credentials) = directory_with(vec![status(401, "")]);
        credentials.set("stale");

        directory.destroy_session().await.unwrap();
        assert_eq!(credentials.get(), None);
    }

    #[tokio::test]
    async fn join_and_leave_hit_the_expected_endpoints() {
        let (directory, requests, credentials) = directory_with(vec![ok("{}"), ok("{}")]);
        credentials.set("tok");

        directory.join_room("R9").await.unwrap();
        directory.leave_room("R9").await.unwrap();

        let recorded = requests.lock().unwrap();
        assert_eq!(recorded[0].path, "/rooms/R9/join");
        assert_eq!(recorded[0].method, Method::Post);
        assert_eq!(recorded[1].path, "/rooms/R9/leave");
        assert_eq!(recorded[1].method, Method::Delete);
    }

    #[tokio::test]
    async fn fetch_history_passes_the_limit() {
        let (directory, requests, credentials) =
            directory_with(vec![ok(r#"{"messages":[]}"#)]);
        credentials.set("tok");

        let messages = directory.fetch_history("R1", 50).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(requests.lock().unwrap()[0].path, "/rooms/R1/messages?limit=50");
    }

    #[tokio::test]
    async fn room_exists_true_on_success() {
        let (directory, requests, _credentials) = directory_with(vec![ok("{}")]);
        assert!(directory.room_exists("R1").await);
        // Probe is the unauthenticated escape hatch.
        assert!(requests.lock().unwrap()[0].bearer.is_none());
    }

    #[tokio::test]
    async fn room_exists_false_on_negative_answer() {
        let (directory, _requests, _credentials) = directory_with(vec![status(404, "")]);
        assert!(!directory.room_exists("nope").await);
    }

    #[tokio::test]
    async fn room_exists_fails_closed_on_network_error() {
        let (directory, _requests, _credentials) =
            directory_with(vec![Err(ParlorError::Request("dns failure".into()))]);
        assert!(!directory.room_exists("R1").await);
    }

    #[tokio::test]
    async fn create_room_returns_the_new_id() {
        let (directory, _requests, credentials) =
            directory_with(vec![ok(r#"{"room_id":"R-new"}"#)]);
        credentials.set("tok");

        let room = directory.create_room().await.unwrap();
        assert_eq!(room, "R-new");
    }

    #[tokio::test]
    async fn list_joined_rooms_parses_list() {
        let (directory, _requests, credentials) =
            directory_with(vec![ok(r#"{"rooms":["A","B"]}"#)]);
        credentials.set("tok");

        let rooms = directory.list_joined_rooms().await.unwrap();
        assert_eq!(rooms, vec!["A".to_string(), "B".to_string()]);
    }
}
