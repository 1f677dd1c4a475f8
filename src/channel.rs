//! Per-room realtime channel.
//!
//! [`RealtimeChannel`] owns at most one live [`Transport`] connection at a
//! time and exposes a typed publish/subscribe surface over the fixed frame
//! vocabulary (`chat`, `typing`, `user_joined`, `user_left`) plus the two
//! local-only lifecycle events (`closed`, `error`) that the channel
//! synthesizes itself.
//!
//! The connection lifecycle is a small visible state machine:
//!
//! ```text
//! Idle ──connect──▶ Connecting ──accept──▶ Open ──close/error──▶ Closed
//! ```
//!
//! An error is a transient signal, not a resting state — subscribers see
//! an `Error` event and the channel then settles in `Closed`. There is no
//! automatic reconnection; the owner decides whether to call
//! [`connect`](RealtimeChannel::connect) again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::credentials::CredentialStore;
use crate::error::{ParlorError, Result};
use crate::protocol::{ClientFrame, RoomId, ServerFrame};
use crate::transport::Transport;

/// How long [`RealtimeChannel::close`] waits for the channel loop to exit
/// gracefully before aborting it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Dials a connected [`Transport`] for one room.
///
/// The credential travels with the connection request (the server reads it
/// from the `session_id` query parameter in the WebSocket case).
#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    async fn connect(&self, room_id: &str, token: &str) -> Result<Box<dyn Transport>>;
}

/// Lifecycle states of a [`RealtimeChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never connected.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and usable for publish/subscribe.
    Open,
    /// The connection ended (remote close, local close, or error).
    Closed,
}

/// The subscribable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Chat,
    Typing,
    UserJoined,
    UserLeft,
    /// Local-only: the connection ended. Emitted exactly once per
    /// connection.
    Closed,
    /// Local-only: a transport error occurred (always followed by
    /// `Closed`).
    Error,
}

/// An event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A frame received from the server.
    Frame(ServerFrame),
    /// The connection ended.
    Closed,
    /// A transport error occurred.
    Error {
        message: String,
    },
}

impl ChannelEvent {
    /// The kind a subscriber registers for to receive this event.
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Frame(ServerFrame::Chat { .. }) => EventKind::Chat,
            ChannelEvent::Frame(ServerFrame::Typing { .. }) => EventKind::Typing,
            ChannelEvent::Frame(ServerFrame::UserJoined { .. }) => EventKind::UserJoined,
            ChannelEvent::Frame(ServerFrame::UserLeft { .. }) => EventKind::UserLeft,
            ChannelEvent::Closed => EventKind::Closed,
            ChannelEvent::Error { .. } => EventKind::Error,
        }
    }
}

// ── Subscriber registry ─────────────────────────────────────────────

struct Registry {
    subscribers: StdMutex<HashMap<EventKind, Vec<(u64, mpsc::UnboundedSender<ChannelEvent>)>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            subscribers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn add(&self, kind: EventKind) -> (u64, mpsc::UnboundedReceiver<ChannelEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entry(kind).or_default().push((id, tx));
        }
        (id, rx)
    }

    fn remove(&self, kind: EventKind, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(entries) = subscribers.get_mut(&kind) {
                entries.retain(|(entry_id, _)| *entry_id != id);
            }
        }
    }

    /// Fan an event out to every subscriber of its kind. Subscribers whose
    /// receiver was dropped are pruned on the way.
    fn dispatch(&self, event: ChannelEvent) {
        let kind = event.kind();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(entries) = subscribers.get_mut(&kind) {
                entries.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            }
        }
    }

    #[cfg(test)]
    fn count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// A live registration for one event kind.
///
/// Each subscription is removable individually: dropping it (or calling
/// [`cancel`](Subscription::cancel)) unregisters exactly this handler and
/// no other, even when several components subscribe to the same kind.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Receive the next event of this subscription's kind.
    ///
    /// Returns `None` once the channel itself has been dropped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// The kind this subscription was registered for.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Explicitly unregister. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.kind, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

// ── Channel ─────────────────────────────────────────────────────────

struct ActiveConnection {
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    /// Set by whichever path emits the `Closed` event first.
    closed_emitted: Arc<AtomicBool>,
}

/// Publish/subscribe façade over one live room connection.
pub struct RealtimeChannel {
    connector: Arc<dyn ChannelConnector>,
    credentials: CredentialStore,
    registry: Arc<Registry>,
    state: Arc<StdMutex<ChannelState>>,
    active: Option<ActiveConnection>,
    connected_room: Option<RoomId>,
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn ChannelConnector>, credentials: CredentialStore) -> Self {
        Self {
            connector,
            credentials,
            registry: Arc::new(Registry::new()),
            state: Arc::new(StdMutex::new(ChannelState::Idle)),
            active: None,
            connected_room: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ChannelState::Closed)
    }

    /// The room the live connection is scoped to, if any.
    pub fn connected_room(&self) -> Option<&str> {
        self.connected_room.as_deref()
    }

    /// Register for events of `kind`. Subscriptions outlive individual
    /// connections: after a reconnect the same subscription sees the new
    /// connection's events.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let (id, rx) = self.registry.add(kind);
        Subscription {
            kind,
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Send a frame to the room.
    ///
    /// # Errors
    ///
    /// Returns [`ParlorError::NotConnected`] unless the channel is `Open`.
    /// `Ok` means the frame was handed to the connection, nothing more —
    /// delivery guarantees are the server's department.
    pub fn publish(&self, frame: ClientFrame) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(ParlorError::NotConnected);
        }
        match &self.active {
            Some(active) => active
                .frame_tx
                .send(frame)
                .map_err(|_| ParlorError::NotConnected),
            None => Err(ParlorError::NotConnected),
        }
    }

    /// Connect to `room_id`, closing any existing connection first (at
    /// most one live connection per channel — the old connection's
    /// subscribers get their `Closed` event before the new dial starts).
    ///
    /// # Errors
    ///
    /// Fails with [`ParlorError::SessionInvalid`] — without any state
    /// transition — when no credential is held. Connector failures emit an
    /// `Error` event, settle the channel in `Closed`, and propagate.
    pub async fn connect(&mut self, room_id: &str) -> Result<()> {
        let Some(token) = self.credentials.get() else {
            return Err(ParlorError::SessionInvalid);
        };

        self.close().await;

        debug!(room_id, "channel connecting");
        self.set_state(ChannelState::Connecting);

        let transport = match self.connector.connect(room_id, &token).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(room_id, error = %e, "channel connect failed");
                self.registry.dispatch(ChannelEvent::Error {
                    message: e.to_string(),
                });
                self.set_state(ChannelState::Closed);
                return Err(e);
            }
        };

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed_emitted = Arc::new(AtomicBool::new(false));

        // Open before spawning: the loop only ever transitions to Closed,
        // so a transport that dies immediately cannot be overwritten back
        // to Open by this thread.
        self.set_state(ChannelState::Open);

        let task = tokio::spawn(channel_loop(
            transport,
            frame_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.state),
            Arc::clone(&closed_emitted),
            shutdown_rx,
        ));

        self.active = Some(ActiveConnection {
            frame_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
            closed_emitted,
        });
        self.connected_room = Some(room_id.to_string());
        debug!(room_id, "channel open");
        Ok(())
    }

    /// Close the live connection, if any. Idempotent.
    ///
    /// Subscribers receive their single `Closed` event before this
    /// returns, even if the loop has to be aborted.
    pub async fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.connected_room = None;

        if let Some(tx) = active.shutdown_tx.take() {
            // Fails only when the loop already exited, which is fine.
            let _ = tx.send(());
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut active.task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                warn!("channel loop terminated with join error: {join_err}");
            }
            Err(_) => {
                warn!("channel loop did not exit within timeout; aborting task");
                active.task.abort();
                if let Err(join_err) = active.task.await {
                    debug!("channel loop aborted: {join_err}");
                }
            }
        }

        // The aborted path may have skipped the loop's own Closed emission.
        emit_closed(&self.registry, &self.state, &active.closed_emitted);
    }

    fn set_state(&self, next: ChannelState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("state", &self.state())
            .field("connected_room", &self.connected_room)
            .finish()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        // `Drop` is synchronous so a graceful close cannot be awaited;
        // aborting drops the loop future immediately.
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

// ── Channel loop ────────────────────────────────────────────────────

/// Background loop multiplexing outbound frames, the shutdown signal, and
/// inbound transport traffic.
///
/// Exits when the transport closes or errors, the outbound channel closes,
/// or shutdown is signalled. All exit paths emit `Closed` exactly once.
async fn channel_loop(
    mut transport: Box<dyn Transport>,
    mut frame_rx: mpsc::UnboundedReceiver<ClientFrame>,
    registry: Arc<Registry>,
    state: Arc<StdMutex<ChannelState>>,
    closed_emitted: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("channel loop started");

    loop {
        tokio::select! {
            // Branch 1: outbound frame from the channel handle
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = transport.send(json).await {
                                    error!("transport send error: {e}");
                                    registry.dispatch(ChannelEvent::Error {
                                        message: format!("transport send error: {e}"),
                                    });
                                    emit_closed(&registry, &state, &closed_emitted);
                                    break;
                                }
                            }
                            Err(e) => {
                                // Serialization errors are programming bugs; don't kill the loop.
                                error!("failed to serialize outbound frame: {e}");
                            }
                        }
                    }
                    None => {
                        debug!("frame channel closed, shutting down channel loop");
                        let _ = transport.close().await;
                        emit_closed(&registry, &state, &closed_emitted);
                        break;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                emit_closed(&registry, &state, &closed_emitted);
                break;
            }

            // Branch 3: inbound frame from the server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => registry.dispatch(ChannelEvent::Frame(frame)),
                            Err(e) => {
                                warn!("failed to deserialize server frame: {e} — raw: {text}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        registry.dispatch(ChannelEvent::Error {
                            message: format!("transport receive error: {e}"),
                        });
                        emit_closed(&registry, &state, &closed_emitted);
                        break;
                    }
                    None => {
                        debug!("transport closed by server");
                        emit_closed(&registry, &state, &closed_emitted);
                        break;
                    }
                }
            }
        }
    }

    debug!("channel loop exited");
}

/// Settle the channel in `Closed` and emit the `Closed` event, exactly
/// once per connection regardless of which path gets here first.
fn emit_closed(
    registry: &Registry,
    state: &StdMutex<ChannelState>,
    closed_emitted: &AtomicBool,
) {
    if closed_emitted.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Ok(mut state) = state.lock() {
        *state = ChannelState::Closed;
    }
    registry.dispatch(ChannelEvent::Closed);
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use std::collections::VecDeque;

    // ── Mock transport / connector ──────────────────────────────────

    struct MockTransport {
        incoming: VecDeque<Option<Result<String>>>,
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
            if let Some(item) = self.incoming.pop_front() {
                item
            } else {
                // Scripted frames exhausted — hang so the loop stays
                // alive until shutdown.
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Hands out scripted transports and records every dial.
    struct MockConnector {
        scripts: StdMutex<VecDeque<Vec<Option<Result<String>>>>>,
        dialed: Arc<StdMutex<Vec<(String, String)>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed_flags: Arc<StdMutex<Vec<Arc<AtomicBool>>>>,
        fail_next: AtomicBool,
    }

    impl MockConnector {
        fn new(scripts: Vec<Vec<Option<Result<String>>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                dialed: Arc::new(StdMutex::new(Vec::new())),
                sent: Arc::new(StdMutex::new(Vec::new())),
                closed_flags: Arc::new(StdMutex::new(Vec::new())),
                fail_next: AtomicBool::new(false),
            })
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
            let incoming = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            let closed = Arc::new(AtomicBool::new(false));
            self.closed_flags.lock().unwrap().push(Arc::clone(&closed));
            Ok(Box::new(MockTransport {
                incoming: VecDeque::from(incoming),
                sent: Arc::clone(&self.sent),
                closed,
            }))
        }
    }

    fn credentialed() -> CredentialStore {
        let credentials = CredentialStore::new();
        credentials.set("tok-1");
        credentials
    }

    fn chat_json(user: &str, message: &str) -> Option<Result<String>> {
        Some(Ok(format!(
            r#"{{"type":"chat","user":"{user}","message":"{message}","timestamp":"t"}}"#
        )))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_without_credential_fails_without_transition() {
        let connector = MockConnector::new(vec![]);
        let mut channel = RealtimeChannel::new(connector.clone(), CredentialStore::new());

        let err = channel.connect("R1").await.unwrap_err();

        assert!(matches!(err, ParlorError::SessionInvalid));
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(connector.dialed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_transitions_to_open_and_passes_credential() {
        let connector = MockConnector::new(vec![vec![]]);
        let mut channel = RealtimeChannel::new(connector.clone(), credentialed());

        assert_eq!(channel.state(), ChannelState::Idle);
        channel.connect("R1").await.unwrap();

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.connected_room(), Some("R1"));
        assert_eq!(
            connector.dialed.lock().unwrap()[0],
            ("R1".to_string(), "tok-1".to_string())
        );
    }

    #[tokio::test]
    async fn frames_fan_out_to_matching_subscribers_only() {
        let connector = MockConnector::new(vec![vec![chat_json("bob", "hi")]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut chat_sub = channel.subscribe(EventKind::Chat);
        let mut typing_sub = channel.subscribe(EventKind::Typing);

        channel.connect("R1").await.unwrap();

        let event = chat_sub.recv().await.unwrap();
        assert_eq!(
            event,
            ChannelEvent::Frame(ServerFrame::Chat {
                user: "bob".into(),
                message: "hi".into(),
                timestamp: "t".into(),
            })
        );

        // The typing subscription must not have seen the chat frame.
        assert!(typing_sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_before_connect_reports_not_connected() {
        let connector = MockConnector::new(vec![]);
        let channel = RealtimeChannel::new(connector, credentialed());

        let err = channel
            .publish(ClientFrame::Chat {
                message: "hi".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ParlorError::NotConnected));
    }

    #[tokio::test]
    async fn publish_sends_serialized_frame() {
        let connector = MockConnector::new(vec![vec![]]);
        let mut channel = RealtimeChannel::new(connector.clone(), credentialed());
        channel.connect("R1").await.unwrap();

        channel
            .publish(ClientFrame::Chat {
                message: "hello".into(),
            })
            .unwrap();

        // Give the loop a moment to process.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = connector.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value, serde_json::json!({"type": "chat", "message": "hello"}));
    }

    #[tokio::test]
    async fn remote_close_emits_closed_once_and_settles_state() {
        // One scripted frame then a clean close.
        let connector = MockConnector::new(vec![vec![chat_json("bob", "hi"), None]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut closed_sub = channel.subscribe(EventKind::Closed);
        channel.connect("R1").await.unwrap();

        assert_eq!(closed_sub.recv().await.unwrap(), ChannelEvent::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);

        // Closing locally afterwards must not produce a second event.
        channel.close().await;
        assert!(closed_sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_error_emits_error_then_closed() {
        let connector = MockConnector::new(vec![vec![Some(Err(ParlorError::TransportReceive(
            "boom".into(),
        )))]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut error_sub = channel.subscribe(EventKind::Error);
        let mut closed_sub = channel.subscribe(EventKind::Closed);
        channel.connect("R1").await.unwrap();

        match error_sub.recv().await.unwrap() {
            ChannelEvent::Error { message } => assert!(message.contains("boom")),
            other => panic!("expected Error event, got {other:?}"),
        }
        assert_eq!(closed_sub.recv().await.unwrap(), ChannelEvent::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn connect_failure_emits_error_and_settles_closed() {
        let connector = MockConnector::new(vec![]);
        connector.fail_next.store(true, Ordering::Relaxed);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut error_sub = channel.subscribe(EventKind::Error);
        let err = channel.connect("R1").await.unwrap_err();

        assert!(matches!(err, ParlorError::TransportReceive(_)));
        assert!(matches!(
            error_sub.recv().await.unwrap(),
            ChannelEvent::Error { .. }
        ));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn reconnect_closes_previous_connection_first() {
        let connector = MockConnector::new(vec![vec![], vec![]]);
        let mut channel = RealtimeChannel::new(connector.clone(), credentialed());

        let mut closed_sub = channel.subscribe(EventKind::Closed);

        channel.connect("R1").await.unwrap();
        channel.connect("R2").await.unwrap();

        // The first connection's subscribers saw exactly one Closed.
        assert_eq!(closed_sub.recv().await.unwrap(), ChannelEvent::Closed);
        assert!(closed_sub.rx.try_recv().is_err());

        // The old transport was closed, and only one connection is live.
        assert!(connector.closed_flags.lock().unwrap()[0].load(Ordering::Relaxed));
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.connected_room(), Some("R2"));
        assert_eq!(connector.dialed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_after_remote_close_reports_not_connected() {
        let connector = MockConnector::new(vec![vec![None]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut closed_sub = channel.subscribe(EventKind::Closed);
        channel.connect("R1").await.unwrap();
        let _ = closed_sub.recv().await;

        let err = channel
            .publish(ClientFrame::Typing {
                user: "alice".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ParlorError::NotConnected));
    }

    #[tokio::test]
    async fn malformed_inbound_frames_are_skipped() {
        let connector = MockConnector::new(vec![vec![
            Some(Ok("{not json".to_string())),
            chat_json("bob", "still alive"),
        ]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());

        let mut chat_sub = channel.subscribe(EventKind::Chat);
        channel.connect("R1").await.unwrap();

        // The garbage frame is logged and skipped; the next one arrives.
        match chat_sub.recv().await.unwrap() {
            ChannelEvent::Frame(ServerFrame::Chat { message, .. }) => {
                assert_eq!(message, "still alive");
            }
            other => panic!("expected chat frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_a_subscription_removes_only_that_registration() {
        let connector = MockConnector::new(vec![]);
        let channel = RealtimeChannel::new(connector, credentialed());

        let first = channel.subscribe(EventKind::Chat);
        let second = channel.subscribe(EventKind::Chat);
        assert_eq!(channel.registry.count(EventKind::Chat), 2);

        drop(first);
        assert_eq!(channel.registry.count(EventKind::Chat), 1);

        second.cancel();
        assert_eq!(channel.registry.count(EventKind::Chat), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let connector = MockConnector::new(vec![vec![]]);
        let mut channel = RealtimeChannel::new(connector, credentialed());
        channel.connect("R1").await.unwrap();

        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn local_close_closes_transport_and_notifies() {
        let connector = MockConnector::new(vec![vec![]]);
        let mut channel = RealtimeChannel::new(connector.clone(), credentialed());

        let mut closed_sub = channel.subscribe(EventKind::Closed);
        channel.connect("R1").await.unwrap();
        channel.close().await;

        assert_eq!(closed_sub.recv().await.unwrap(), ChannelEvent::Closed);
        assert!(connector.closed_flags.lock().unwrap()[0].load(Ordering::Relaxed));
    }
}
