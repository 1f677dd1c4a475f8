#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Parlor client integration tests.
//!
//! Provides a scriptable [`MockConnector`]/`MockTransport` pair for the
//! realtime side, a [`ScriptedExchange`] for the REST side, and helper
//! functions for building common server JSON bodies and frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use parlor_client::{
    ChannelConnector, HttpExchange, HttpRequest, HttpResponse, ParlorError, Result, Transport,
};

// ── MockTransport / MockConnector ───────────────────────────────────

/// A channel-based mock transport handed out by [`MockConnector`].
///
/// Scripted frames are consumed first; afterwards `recv` waits on the
/// live injection channel, so tests can feed frames after connect.
pub struct MockTransport {
    scripted: VecDeque<Option<Result<String>>>,
    live_rx: mpsc::UnboundedReceiver<Option<Result<String>>>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        if let Some(item) = self.scripted.pop_front() {
            return item;
        }
        match self.live_rx.recv().await {
            Some(item) => item,
            // Injector dropped — hang so the loop stays alive until
            // shutdown, like a quiet-but-healthy connection would.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Hands out [`MockTransport`]s, records every dial, and lets tests
/// inject frames into the most recent connection.
pub struct MockConnector {
    scripts: StdMutex<VecDeque<Vec<Option<Result<String>>>>>,
    /// Every `(room_id, token)` pair dialed, in order.
    pub dialed: Arc<StdMutex<Vec<(String, String)>>>,
    /// Every frame the client sent, across all connections.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Close flags of every handed-out transport, in dial order.
    pub closed_flags: Arc<StdMutex<Vec<Arc<AtomicBool>>>>,
    /// When set, the next dial fails with a transport error.
    pub fail_next: AtomicBool,
    live_senders: StdMutex<Vec<mpsc::UnboundedSender<Option<Result<String>>>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::with_scripts(vec![])
    }

    /// Pre-script the first connections' incoming frames; later dials get
    /// an empty script and rely on live injection.
    pub fn with_scripts(scripts: Vec<Vec<Option<Result<String>>>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into()),
            dialed: Arc::new(StdMutex::new(Vec::new())),
            sent: Arc::new(StdMutex::new(Vec::new())),
            closed_flags: Arc::new(StdMutex::new(Vec::new())),
            fail_next: AtomicBool::new(false),
            live_senders: StdMutex::new(Vec::new()),
        })
    }

    fn inject(&self, item: Option<Result<String>>) {
        let senders = self.live_senders.lock().unwrap();
        let sender = senders.last().expect("no live connection to inject into");
        sender.send(item).expect("live connection gone");
    }

    /// Deliver a server frame on the most recent connection.
    pub fn push_frame(&self, json: impl Into<String>) {
        self.inject(Some(Ok(json.into())));
    }

    /// Deliver a transport error on the most recent connection.
    pub fn push_error(&self, message: &str) {
        self.inject(Some(Err(ParlorError::TransportReceive(message.into()))));
    }

    /// Close the most recent connection from the server side.
    pub fn push_server_close(&self) {
        self.inject(None);
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, room_id: &str, token: &str) -> Result<Box<dyn Transport>> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(ParlorError::TransportReceive("dial refused".into()));
        }
        self.dialed
            .lock()
            .unwrap()
            .push((room_id.to_string(), token.to_string()));

        let scripted = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        self.live_senders.lock().unwrap().push(live_tx);
        let closed = Arc::new(AtomicBool::new(false));
        self.closed_flags.lock().unwrap().push(Arc::clone(&closed));

        Ok(Box::new(MockTransport {
            scripted: VecDeque::from(scripted),
            live_rx,
            sent: Arc::clone(&self.sent),
            closed,
        }))
    }
}

// ── ScriptedExchange ────────────────────────────────────────────────

/// Records every REST request and replays scripted responses in order.
/// Once the script runs out, answers `200 {}`.
pub struct ScriptedExchange {
    responses: StdMutex<VecDeque<Result<HttpResponse>>>,
    /// Every request made, in order.
    pub requests: Arc<StdMutex<Vec<HttpRequest>>>,
}

impl ScriptedExchange {
    pub fn new(responses: Vec<Result<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            requests: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    /// Append another scripted response.
    pub fn push_response(&self, response: Result<HttpResponse>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Paths of every recorded request, in order.
    pub fn paths(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.path.clone())
            .collect()
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
                body: b"{}".to_vec(),
            }))
    }
}

// ── Response helpers ────────────────────────────────────────────────

pub fn ok(body: &str) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status: 200,
        body: body.as_bytes().to_vec(),
    })
}

pub fn status(code: u16, body: &str) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status: code,
        body: body.as_bytes().to_vec(),
    })
}

/// Body of `GET /sessions/me`.
pub fn session_json(username: &str, joined_rooms: &[&str]) -> String {
    serde_json::json!({
        "username": username,
        "joined_rooms": joined_rooms,
    })
    .to_string()
}

/// Body of `GET /rooms`.
pub fn rooms_json(rooms: &[&str]) -> String {
    serde_json::json!({ "rooms": rooms }).to_string()
}

/// Body of `GET /rooms/{id}/messages`, entries as `(user, message, timestamp)`.
pub fn history_json(entries: &[(&str, &str, &str)]) -> String {
    let messages: Vec<serde_json::Value> = entries
        .iter()
        .map(|(user, message, timestamp)| {
            serde_json::json!({
                "type": "chat",
                "user": user,
                "message": message,
                "timestamp": timestamp,
            })
        })
        .collect();
    serde_json::json!({ "messages": messages }).to_string()
}

// ── Frame helpers ───────────────────────────────────────────────────

pub fn chat_frame(user: &str, message: &str, timestamp: &str) -> String {
    serde_json::json!({
        "type": "chat",
        "user": user,
        "message": message,
        "timestamp": timestamp,
    })
    .to_string()
}

pub fn typing_frame(user: &str) -> String {
    serde_json::json!({ "type": "typing", "user": user }).to_string()
}

pub fn user_joined_frame(user: &str) -> String {
    serde_json::json!({
        "type": "user_joined",
        "user": user,
        "message": format!("{user} joined the room"),
        "timestamp": "2024-01-01T00:00:10Z",
    })
    .to_string()
}

pub fn user_left_frame(user: &str) -> String {
    serde_json::json!({
        "type": "user_left",
        "user": user,
        "message": format!("{user} left the room"),
        "timestamp": "2024-01-01T00:00:20Z",
    })
    .to_string()
}
