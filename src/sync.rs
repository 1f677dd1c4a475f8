//! Room synchronization orchestrator.
//!
//! [`ChatRoomSynchronizer`] composes the session directory, the credential
//! store, and the realtime channel into one consistent observable state:
//! an ordered message timeline, the joined-room list, and the transient
//! typing indicator. Every REST snapshot and every realtime frame funnels
//! through its single reconciliation path, so observers never see history
//! and live messages interleaved out of order.
//!
//! Observers consume [`SyncEvent`] diffs from the receiver returned by
//! [`ChatRoomSynchronizer::new`], and can read the current state through
//! the accessors at any point.
//!
//! # Ordering
//!
//! Activation appends the (chronologically normalized) history batch to
//! the timeline **before** the realtime connection is opened. The event
//! pump subscribes before the dial, so a frame the server sends
//! immediately on accept still lands after every history entry, whatever
//! the relative latency of the two paths.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::channel::{ChannelEvent, EventKind, RealtimeChannel, Subscription};
use crate::credentials::CredentialStore;
use crate::directory::SessionDirectory;
use crate::error::{ParlorError, Result};
use crate::protocol::{ClientFrame, Message, MessageKind, RoomId, ServerFrame};

/// Default number of history messages fetched on activation.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Quiet interval after which the typing indicator expires.
const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_millis(2000);

/// Default capacity of the bounded sync event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Configuration ───────────────────────────────────────────────────

/// Tuning knobs for a [`ChatRoomSynchronizer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of history messages fetched on activation.
    /// Defaults to **50**.
    pub history_limit: usize,
    /// Quiet interval after which the typing indicator clears.
    /// Defaults to **2000 ms**.
    pub typing_expiry: Duration,
    /// Capacity of the bounded [`SyncEvent`] channel. When the consumer
    /// cannot keep up, diff events are dropped (with a warning logged);
    /// `Redirect` events are always delivered. Defaults to **256**.
    pub event_channel_capacity: usize,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            typing_expiry: DEFAULT_TYPING_EXPIRY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Set the history fetch limit.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set the typing indicator expiry interval.
    #[must_use]
    pub fn with_typing_expiry(mut self, expiry: Duration) -> Self {
        self.typing_expiry = expiry;
        self
    }

    /// Set the event channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Why the synchronizer is asking the embedder to navigate back to the
/// unauthenticated entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectReason {
    /// No credential was held when activation started.
    Unauthenticated,
    /// The credential was rejected while fetching the session.
    SessionRejected,
    /// The realtime channel could not be opened.
    ConnectFailed,
    /// The user left the active room while still a member of others.
    SignedOut,
    /// The user left the active room and no joined rooms remain.
    NoRoomsLeft,
}

/// State diffs delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A message was appended to the timeline (history or live).
    TimelineAppended(Message),
    /// The joined-room list changed.
    RoomListChanged(Vec<RoomId>),
    /// The typing indicator changed: `Some(author)` set, `None` cleared.
    TypingChanged(Option<String>),
    /// The requested room does not exist.
    RoomMissing(RoomId),
    /// Navigate to the unauthenticated entry point. Always delivered.
    Redirect(RedirectReason),
    /// The realtime connection ended.
    ConnectionClosed,
    /// The realtime connection reported an error.
    ConnectionError { message: String },
}

// ── View state ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RoomView {
    username: String,
    active_room: Option<RoomId>,
    /// Strict receipt order: history batch first, then live frames.
    timeline: Vec<Message>,
    rooms: Vec<RoomId>,
    typing: Option<String>,
}

// ── Synchronizer ────────────────────────────────────────────────────

/// Orchestrates session, directory snapshots, and the realtime channel
/// into one consistent room view.
pub struct ChatRoomSynchronizer {
    directory: SessionDirectory,
    channel: RealtimeChannel,
    config: SyncConfig,
    view: Arc<StdMutex<RoomView>>,
    event_tx: mpsc::Sender<SyncEvent>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl ChatRoomSynchronizer {
    /// Create a synchronizer and the observer's event receiver.
    ///
    /// `directory` and `channel` must share one [`CredentialStore`] — the
    /// directory's transport owns the clearing-on-401 behavior, the
    /// channel reads the token when dialing.
    #[must_use = "the event receiver must be consumed to observe state diffs"]
    pub fn new(
        directory: SessionDirectory,
        channel: RealtimeChannel,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            Self {
                directory,
                channel,
                config,
                view: Arc::new(StdMutex::new(RoomView::default())),
                event_tx,
                pump: None,
            },
            event_rx,
        )
    }

    fn credentials(&self) -> &CredentialStore {
        self.directory.transport().credentials()
    }

    // ── Activation ──────────────────────────────────────────────────

    /// Make `room_id` the active room.
    ///
    /// Runs the full activation sequence: authentication gate, session
    /// fetch, existence probe, history batch, membership reconciliation
    /// (with implicit join for shared-link visits), then the realtime
    /// connection. History failures degrade to an empty timeline; the
    /// gates and the connection are terminal and emit the matching
    /// [`SyncEvent`] before failing. Earlier steps' side effects are not
    /// rolled back on a later failure.
    pub async fn activate(&mut self, room_id: &str) -> Result<()> {
        // Authentication gate: no credential, no activation.
        if !self.credentials().is_authenticated() {
            self.redirect(RedirectReason::Unauthenticated).await;
            return Err(ParlorError::SessionInvalid);
        }

        // Session record. There is no partial-auth state: any failure
        // here ends the attempt.
        let session = match self.directory.current_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "session fetch failed during activation");
                self.redirect(RedirectReason::SessionRejected).await;
                return Err(e);
            }
        };

        // Existence probe, fails closed.
        if !self.directory.room_exists(room_id).await {
            let _ = self
                .event_tx
                .send(SyncEvent::RoomMissing(room_id.to_string()))
                .await;
            return Err(ParlorError::RoomNotFound {
                room_id: room_id.to_string(),
            });
        }

        // Fresh view for this activation; a previous pump, if any, ends
        // its visibility window here.
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Retire the previous room's connection now, before the new
        // subscriptions register: its Closed event belongs to the old
        // room and must never surface as a disconnect of this one.
        self.channel.close().await;
        if let Ok(mut view) = self.view.lock() {
            *view = RoomView {
                username: session.username.clone(),
                active_room: Some(room_id.to_string()),
                rooms: session.joined_rooms.clone(),
                ..RoomView::default()
            };
        }

        // History batch, normalized to chronological order. Degrades to
        // an empty timeline on failure: the room is still usable.
        match self
            .directory
            .fetch_history(room_id, self.config.history_limit)
            .await
        {
            Ok(messages) => {
                let messages = chronological(messages);
                if let Ok(mut view) = self.view.lock() {
                    view.timeline.extend(messages.iter().cloned());
                }
                for message in messages {
                    emit(&self.event_tx, SyncEvent::TimelineAppended(message));
                }
            }
            Err(e) => {
                warn!(room_id, error = %e, "history fetch failed, starting with empty timeline");
            }
        }

        // Membership snapshot. The active room must always appear in the
        // list, even when the visit came through a shared link — join
        // implicitly and append locally.
        match self.directory.list_joined_rooms().await {
            Ok(mut rooms) => {
                if !rooms.iter().any(|room| room == room_id) {
                    match self.directory.join_room(room_id).await {
                        Ok(()) => rooms.push(room_id.to_string()),
                        Err(e) => {
                            warn!(room_id, error = %e, "implicit join failed");
                        }
                    }
                }
                if let Ok(mut view) = self.view.lock() {
                    view.rooms = rooms.clone();
                }
                emit(&self.event_tx, SyncEvent::RoomListChanged(rooms));
            }
            Err(e) => {
                warn!(error = %e, "room list fetch failed, keeping session snapshot");
                let rooms = self
                    .view
                    .lock()
                    .map(|view| view.rooms.clone())
                    .unwrap_or_default();
                emit(&self.event_tx, SyncEvent::RoomListChanged(rooms));
            }
        }

        // Subscribe before dialing: a frame delivered immediately on
        // accept still reaches the pump, and the history batch above is
        // already in place, so the timeline order holds regardless of
        // latency.
        let subscriptions = Subscriptions {
            chat: self.channel.subscribe(EventKind::Chat),
            typing: self.channel.subscribe(EventKind::Typing),
            user_joined: self.channel.subscribe(EventKind::UserJoined),
            user_left: self.channel.subscribe(EventKind::UserLeft),
            closed: self.channel.subscribe(EventKind::Closed),
            error: self.channel.subscribe(EventKind::Error),
        };
        self.pump = Some(tokio::spawn(event_pump(
            subscriptions,
            session.username,
            Arc::clone(&self.view),
            self.event_tx.clone(),
            self.config.typing_expiry,
        )));

        // Connectivity is core to the product: a failed dial is terminal.
        if let Err(e) = self.channel.connect(room_id).await {
            error!(room_id, error = %e, "realtime connect failed during activation");
            self.redirect(RedirectReason::ConnectFailed).await;
            return Err(e);
        }

        debug!(room_id, "room activated");
        Ok(())
    }

    // ── Outbound actions ────────────────────────────────────────────

    /// Send a chat message to the active room.
    ///
    /// The message is appended to the timeline when the server echoes it
    /// back on the channel, not locally.
    ///
    /// # Errors
    ///
    /// [`ParlorError::Validation`] for an empty message,
    /// [`ParlorError::NotConnected`] when the channel is not open.
    pub fn send_chat(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParlorError::Validation {
                message: "message must not be empty".into(),
            });
        }
        self.channel.publish(ClientFrame::Chat {
            message: text.to_string(),
        })
    }

    /// Announce that the local user is typing.
    ///
    /// Unthrottled: callers invoke this per keystroke, throttling is a UI
    /// concern. A closed channel just means no indicator reaches peers.
    pub fn notify_typing(&self) {
        let user = self
            .view
            .lock()
            .map(|view| view.username.clone())
            .unwrap_or_default();
        if let Err(e) = self.channel.publish(ClientFrame::Typing { user }) {
            debug!(error = %e, "typing notification dropped");
        }
    }

    /// Leave a room.
    ///
    /// Leaving the **active** room tears the whole session down: the
    /// channel is closed, the session destroyed server-side (best
    /// effort), and a redirect emitted — `NoRoomsLeft` when this was the
    /// user's last joined room, `SignedOut` otherwise. Leaving any other
    /// room only updates membership — the channel is untouched.
    pub async fn leave_room(&mut self, room_id: &str) -> Result<()> {
        let (is_active, no_rooms_left) = self
            .view
            .lock()
            .map(|view| {
                (
                    view.active_room.as_deref() == Some(room_id),
                    view.rooms.iter().all(|room| room == room_id),
                )
            })
            .unwrap_or((false, true));

        if is_active {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
            self.channel.close().await;
            if let Err(e) = self.directory.destroy_session().await {
                warn!(error = %e, "session teardown failed while leaving room");
            }
            if let Ok(mut view) = self.view.lock() {
                *view = RoomView::default();
            }
            let reason = if no_rooms_left {
                RedirectReason::NoRoomsLeft
            } else {
                RedirectReason::SignedOut
            };
            self.redirect(reason).await;
            return Ok(());
        }

        self.directory.leave_room(room_id).await?;
        let rooms = {
            if let Ok(mut view) = self.view.lock() {
                view.rooms.retain(|room| room != room_id);
                view.rooms.clone()
            } else {
                Vec::new()
            }
        };
        emit(&self.event_tx, SyncEvent::RoomListChanged(rooms));
        Ok(())
    }

    /// Stop the pump and close the channel without touching the session.
    pub async fn shutdown(&mut self) {
        debug!("synchronizer shutdown requested");
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.channel.close().await;
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The current timeline, in presentation order.
    pub fn timeline(&self) -> Vec<Message> {
        self.view
            .lock()
            .map(|view| view.timeline.clone())
            .unwrap_or_default()
    }

    /// The joined-room list as last reconciled.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.view
            .lock()
            .map(|view| view.rooms.clone())
            .unwrap_or_default()
    }

    /// Author currently shown as typing, if any.
    pub fn typing_author(&self) -> Option<String> {
        self.view.lock().ok().and_then(|view| view.typing.clone())
    }

    /// The authenticated username, empty before the first activation.
    pub fn username(&self) -> String {
        self.view
            .lock()
            .map(|view| view.username.clone())
            .unwrap_or_default()
    }

    /// The active room, if a room is activated.
    pub fn active_room(&self) -> Option<RoomId> {
        self.view.lock().ok().and_then(|view| view.active_room.clone())
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Redirects are never dropped: blocking send, unlike diff events.
    async fn redirect(&self, reason: RedirectReason) {
        if self.event_tx.send(SyncEvent::Redirect(reason)).await.is_err() {
            debug!("sync event channel closed, receiver dropped");
        }
    }
}

impl std::fmt::Debug for ChatRoomSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoomSynchronizer")
            .field("active_room", &self.active_room())
            .field("channel", &self.channel)
            .finish()
    }
}

impl Drop for ChatRoomSynchronizer {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Normalize a history snapshot to chronological order.
///
/// Stable sort on the ISO 8601 timestamp string: entries with equal or
/// missing timestamps keep their arrival order.
fn chronological(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    messages
}

// ── Event pump ──────────────────────────────────────────────────────

struct Subscriptions {
    chat: Subscription,
    typing: Subscription,
    user_joined: Subscription,
    user_left: Subscription,
    closed: Subscription,
    error: Subscription,
}

/// Emit a diff event. If the channel is full, log and drop it rather
/// than blocking the reconciliation path.
fn emit(event_tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "sync event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("sync event channel closed, receiver dropped");
        }
    }
}

/// Sleep until the typing indicator deadline, or forever when none is
/// pending.
async fn typing_expiry_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Background reconciliation loop: applies realtime events to the shared
/// view and forwards diffs to observers.
///
/// Exits when the channel (and thus every subscription) is gone, or when
/// a re-activation replaces it.
async fn event_pump(
    mut subscriptions: Subscriptions,
    username: String,
    view: Arc<StdMutex<RoomView>>,
    event_tx: mpsc::Sender<SyncEvent>,
    typing_expiry: Duration,
) {
    debug!("event pump started");

    // Single-shot expiry: reset on each qualifying typing event, never
    // more than one pending deadline.
    let mut typing_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = typing_expiry_elapsed(typing_deadline), if typing_deadline.is_some() => {
                typing_deadline = None;
                if let Ok(mut view) = view.lock() {
                    view.typing = None;
                }
                emit(&event_tx, SyncEvent::TypingChanged(None));
            }

            event = subscriptions.chat.recv() => {
                match event {
                    Some(ChannelEvent::Frame(ServerFrame::Chat { user, message, timestamp })) => {
                        // A chat message from another author supersedes
                        // their pending typing indicator.
                        if user != username && typing_deadline.take().is_some() {
                            if let Ok(mut view) = view.lock() {
                                view.typing = None;
                            }
                            emit(&event_tx, SyncEvent::TypingChanged(None));
                        }
                        append_message(
                            &view,
                            &event_tx,
                            Message {
                                kind: MessageKind::Chat,
                                author: user,
                                body: message,
                                timestamp,
                            },
                        );
                    }
                    Some(other) => debug!(?other, "unexpected event on chat subscription"),
                    None => break,
                }
            }

            event = subscriptions.typing.recv() => {
                match event {
                    Some(ChannelEvent::Frame(ServerFrame::Typing { user })) => {
                        // Self-suppression: the local user's own typing
                        // events never set the indicator.
                        if user == username {
                            continue;
                        }
                        typing_deadline = Some(Instant::now() + typing_expiry);
                        if let Ok(mut view) = view.lock() {
                            view.typing = Some(user.clone());
                        }
                        emit(&event_tx, SyncEvent::TypingChanged(Some(user)));
                    }
                    Some(other) => debug!(?other, "unexpected event on typing subscription"),
                    None => break,
                }
            }

            event = subscriptions.user_joined.recv() => {
                match event {
                    Some(ChannelEvent::Frame(ServerFrame::UserJoined { user, message, timestamp })) => {
                        // Membership list is a snapshot, refreshed only by
                        // explicit re-fetch; this only feeds the timeline.
                        append_message(
                            &view,
                            &event_tx,
                            Message {
                                kind: MessageKind::UserJoined,
                                author: user,
                                body: message,
                                timestamp,
                            },
                        );
                    }
                    Some(other) => debug!(?other, "unexpected event on user_joined subscription"),
                    None => break,
                }
            }

            event = subscriptions.user_left.recv() => {
                match event {
                    Some(ChannelEvent::Frame(ServerFrame::UserLeft { user, message, timestamp })) => {
                        append_message(
                            &view,
                            &event_tx,
                            Message {
                                kind: MessageKind::UserLeft,
                                author: user,
                                body: message,
                                timestamp,
                            },
                        );
                    }
                    Some(other) => debug!(?other, "unexpected event on user_left subscription"),
                    None => break,
                }
            }

            event = subscriptions.closed.recv() => {
                match event {
                    Some(ChannelEvent::Closed) => {
                        debug!("realtime connection closed");
                        emit(&event_tx, SyncEvent::ConnectionClosed);
                    }
                    Some(other) => debug!(?other, "unexpected event on closed subscription"),
                    None => break,
                }
            }

            event = subscriptions.error.recv() => {
                match event {
                    Some(ChannelEvent::Error { message }) => {
                        warn!(message, "realtime connection error");
                        emit(&event_tx, SyncEvent::ConnectionError { message });
                    }
                    Some(other) => debug!(?other, "unexpected event on error subscription"),
                    None => break,
                }
            }
        }
    }

    debug!("event pump exited");
}

/// Append to the timeline in strict receipt order and emit the diff.
fn append_message(
    view: &StdMutex<RoomView>,
    event_tx: &mpsc::Sender<SyncEvent>,
    message: Message,
) {
    if let Ok(mut view) = view.lock() {
        view.timeline.push(message.clone());
    }
    emit(event_tx, SyncEvent::TimelineAppended(message));
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

    fn message(body: &str, timestamp: &str) -> Message {
        Message {
            kind: MessageKind::Chat,
            author: "a".into(),
            body: body.into(),
            timestamp: timestamp.into(),
        }
    }

    #[test]
    fn chronological_sorts_by_timestamp() {
        let sorted = chronological(vec![
            message("third", "2024-01-03T00:00:00Z"),
            message("first", "2024-01-01T00:00:00Z"),
            message("second", "2024-01-02T00:00:00Z"),
        ]);
        let bodies: Vec<&str> = sorted.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[test]
    fn chronological_is_stable_for_missing_timestamps() {
        let sorted = chronological(vec![
            message("one", ""),
            message("two", ""),
            message("three", ""),
        ]);
        let bodies: Vec<&str> = sorted.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[test]
    fn config_defaults() {
        let config = SyncConfig::new();
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.typing_expiry, Duration::from_millis(2000));
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn config_builder_clamps_capacity() {
        let config = SyncConfig::new()
            .with_history_limit(10)
            .with_typing_expiry(Duration::from_millis(500))
            .with_event_channel_capacity(0);
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.typing_expiry, Duration::from_millis(500));
        assert_eq!(config.event_channel_capacity, 1);
    }
}
