//! Integration tests for the room synchronizer.
//!
//! Uses the shared mocks from `tests/common` to script the REST surface
//! and the realtime connection, and verifies the full activation flow,
//! timeline ordering, the typing indicator lifecycle, and the redirect
//! paths.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use parlor_client::{
    AuthenticatedTransport, ChatRoomSynchronizer, CredentialStore, HttpResponse, ParlorError,
    RealtimeChannel, RedirectReason, Result, SessionDirectory, SyncConfig, SyncEvent,
};

use common::{
    chat_frame, history_json, ok, rooms_json, session_json, status, typing_frame,
    user_joined_frame, user_left_frame, MockConnector, ScriptedExchange,
};

// ════════════════════════════════════════════════════════════════════
// Harness
// ════════════════════════════════════════════════════════════════════

struct Harness {
    sync: ChatRoomSynchronizer,
    events: mpsc::Receiver<SyncEvent>,
    connector: Arc<MockConnector>,
    exchange: Arc<ScriptedExchange>,
    credentials: CredentialStore,
}

/// Build a synchronizer wired to scripted mocks, with a credential
/// already stored.
fn harness(responses: Vec<Result<HttpResponse>>) -> Harness {
    harness_with_credential(responses, true)
}

fn harness_with_credential(responses: Vec<Result<HttpResponse>>, credentialed: bool) -> Harness {
    let exchange = ScriptedExchange::new(responses);
    let credentials = CredentialStore::new();
    if credentialed {
        credentials.set("tok-1");
    }
    let transport = AuthenticatedTransport::new(exchange.clone(), credentials.clone());
    let directory = SessionDirectory::new(transport);
    let connector = MockConnector::new();
    let channel = RealtimeChannel::new(connector.clone(), credentials.clone());
    let (sync, events) = ChatRoomSynchronizer::new(directory, channel, SyncConfig::new());
    Harness {
        sync,
        events,
        connector,
        exchange,
        credentials,
    }
}

/// Scripted responses for a successful activation of a room the user is
/// already a member of: session fetch, existence probe, history,
/// joined-room list.
fn member_activation(
    username: &str,
    rooms: &[&str],
    history: &str,
) -> Vec<Result<HttpResponse>> {
    vec![
        ok(&session_json(username, rooms)),
        ok("{}"),
        ok(history),
        ok(&rooms_json(rooms)),
    ]
}

/// Consume the activation burst: one `TimelineAppended` per history
/// entry, then the `RoomListChanged` snapshot. Returns the appended
/// message bodies in delivery order.
async fn drain_activation(
    events: &mut mpsc::Receiver<SyncEvent>,
    history_len: usize,
) -> Vec<String> {
    let mut bodies = Vec::new();
    for _ in 0..history_len {
        match events.recv().await.expect("history event") {
            SyncEvent::TimelineAppended(message) => bodies.push(message.body),
            other => panic!("expected TimelineAppended, got {other:?}"),
        }
    }
    match events.recv().await.expect("room list event") {
        SyncEvent::RoomListChanged(_) => {}
        other => panic!("expected RoomListChanged, got {other:?}"),
    }
    bodies
}

// ════════════════════════════════════════════════════════════════════
// Activation flow
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn activation_orders_history_before_live_frames() {
    // History delivered out of order: the synchronizer must normalize.
    let history = history_json(&[
        ("bob", "second", "2024-01-01T00:00:02Z"),
        ("alice", "first", "2024-01-01T00:00:01Z"),
    ]);
    let mut h = harness(member_activation("alice", &["lobby"], &history));

    h.sync.activate("lobby").await.unwrap();

    let bodies = drain_activation(&mut h.events, 2).await;
    assert_eq!(bodies, vec!["first".to_string(), "second".to_string()]);

    // A frame arriving right after connect lands strictly after history.
    h.connector.push_frame(chat_frame("bob", "live", "2024-01-01T00:00:03Z"));
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => assert_eq!(message.body, "live"),
        other => panic!("expected live TimelineAppended, got {other:?}"),
    }

    let timeline = h.sync.timeline();
    let bodies: Vec<&str> = timeline.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["first", "second", "live"]);
}

#[tokio::test]
async fn activation_dials_with_stored_credential() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));

    h.sync.activate("lobby").await.unwrap();

    assert_eq!(
        h.connector.dialed.lock().unwrap()[0],
        ("lobby".to_string(), "tok-1".to_string())
    );
    assert_eq!(h.sync.active_room().as_deref(), Some("lobby"));
    assert_eq!(h.sync.username(), "alice");
}

#[tokio::test]
async fn activation_without_credential_redirects() {
    let mut h = harness_with_credential(vec![], false);

    let err = h.sync.activate("lobby").await.unwrap_err();

    assert!(matches!(err, ParlorError::SessionInvalid));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::Redirect(RedirectReason::Unauthenticated)
    );
    assert!(h.exchange.requests.lock().unwrap().is_empty());
    assert!(h.connector.dialed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_session_redirects_and_clears_credential() {
    let mut h = harness(vec![status(401, "{}")]);

    let err = h.sync.activate("lobby").await.unwrap_err();

    assert!(matches!(err, ParlorError::SessionInvalid));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::Redirect(RedirectReason::SessionRejected)
    );
    assert_eq!(h.credentials.get(), None);
}

#[tokio::test]
async fn missing_room_is_reported() {
    let mut h = harness(vec![
        ok(&session_json("alice", &[])),
        status(404, "{}"), // existence probe
    ]);

    let err = h.sync.activate("ghost").await.unwrap_err();

    assert!(matches!(err, ParlorError::RoomNotFound { .. }));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::RoomMissing("ghost".to_string())
    );
    assert!(h.connector.dialed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn history_failure_degrades_to_empty_timeline() {
    let mut h = harness(vec![
        ok(&session_json("alice", &["lobby"])),
        ok("{}"),
        status(500, ""), // history fetch fails
        ok(&rooms_json(&["lobby"])),
    ]);

    h.sync.activate("lobby").await.unwrap();

    drain_activation(&mut h.events, 0).await;
    assert!(h.sync.timeline().is_empty());
    // The room is still live.
    assert_eq!(h.connector.dialed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn shared_link_visit_joins_implicitly() {
    // Bob opens a room link he never joined: the list snapshot lacks the
    // room, so the synchronizer joins it on his behalf.
    let mut h = harness(vec![
        ok(&session_json("bob", &["other"])),
        ok("{}"),
        ok(&history_json(&[])),
        ok(&rooms_json(&["other"])),
        ok("{}"), // implicit join
    ]);

    h.sync.activate("shared").await.unwrap();

    match h.events.recv().await.unwrap() {
        SyncEvent::RoomListChanged(rooms) => {
            assert_eq!(rooms, vec!["other".to_string(), "shared".to_string()]);
        }
        other => panic!("expected RoomListChanged, got {other:?}"),
    }
    assert!(h.exchange.paths().contains(&"/rooms/shared/join".to_string()));
}

#[tokio::test]
async fn member_rooms_are_not_rejoined() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));

    h.sync.activate("lobby").await.unwrap();

    drain_activation(&mut h.events, 0).await;
    assert!(!h.exchange.paths().contains(&"/rooms/lobby/join".to_string()));
}

#[tokio::test]
async fn connect_failure_redirects() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.connector.fail_next.store(true, Ordering::Relaxed);

    let err = h.sync.activate("lobby").await.unwrap_err();
    assert!(matches!(err, ParlorError::TransportReceive(_)));

    drain_activation(&mut h.events, 0).await;
    // The pump may surface the connection error concurrently with the
    // redirect; scan past it.
    loop {
        match h.events.recv().await.expect("redirect event") {
            SyncEvent::Redirect(reason) => {
                assert_eq!(reason, RedirectReason::ConnectFailed);
                break;
            }
            SyncEvent::ConnectionError { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Live frames
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_and_leave_notices_append_to_timeline() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.connector.push_frame(user_joined_frame("bob"));
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => {
            assert_eq!(message.body, "bob joined the room");
        }
        other => panic!("expected join notice, got {other:?}"),
    }

    h.connector.push_frame(user_left_frame("bob"));
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => {
            assert_eq!(message.body, "bob left the room");
        }
        other => panic!("expected leave notice, got {other:?}"),
    }

    // Presence notices feed the timeline only, never the room list.
    assert_eq!(h.sync.rooms(), vec!["lobby".to_string()]);
}

#[tokio::test]
async fn server_close_surfaces_connection_closed() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.connector.push_server_close();

    assert_eq!(h.events.recv().await.unwrap(), SyncEvent::ConnectionClosed);
}

#[tokio::test]
async fn transport_error_surfaces_error_then_closed() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.connector.push_error("wire snapped");

    // The pump drains the error and closed subscriptions concurrently,
    // so the two events may arrive in either order.
    let mut saw_error = false;
    let mut saw_closed = false;
    for _ in 0..2 {
        match h.events.recv().await.unwrap() {
            SyncEvent::ConnectionError { message } => {
                assert!(message.contains("wire snapped"));
                saw_error = true;
            }
            SyncEvent::ConnectionClosed => saw_closed = true,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_error && saw_closed);
}

// ════════════════════════════════════════════════════════════════════
// Typing indicator
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn own_typing_never_sets_indicator() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    // Alice's own typing frame, echoed by the server, is suppressed.
    h.connector.push_frame(typing_frame("alice"));
    h.connector.push_frame(chat_frame("bob", "hi", "t"));

    // The next observable event is the chat message; no TypingChanged
    // was emitted in between.
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => assert_eq!(message.body, "hi"),
        other => panic!("expected TimelineAppended, got {other:?}"),
    }
    assert_eq!(h.sync.typing_author(), None);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_sets_then_expires() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    let started = tokio::time::Instant::now();
    h.connector.push_frame(typing_frame("bob"));

    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::TypingChanged(Some("bob".to_string()))
    );
    assert_eq!(h.sync.typing_author().as_deref(), Some("bob"));

    // Paused time auto-advances to the expiry deadline.
    assert_eq!(h.events.recv().await.unwrap(), SyncEvent::TypingChanged(None));
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(h.sync.typing_author(), None);
}

#[tokio::test(start_paused = true)]
async fn repeated_typing_extends_the_deadline() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    let started = tokio::time::Instant::now();
    h.connector.push_frame(typing_frame("bob"));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::TypingChanged(Some("bob".to_string()))
    );

    tokio::time::advance(Duration::from_millis(1500)).await;

    // A second typing event resets the single-shot deadline.
    h.connector.push_frame(typing_frame("bob"));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::TypingChanged(Some("bob".to_string()))
    );

    assert_eq!(h.events.recv().await.unwrap(), SyncEvent::TypingChanged(None));
    // Expiry happened a full interval after the second event.
    assert!(started.elapsed() >= Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn chat_from_typing_author_clears_the_indicator() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.connector.push_frame(typing_frame("bob"));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::TypingChanged(Some("bob".to_string()))
    );

    h.connector.push_frame(chat_frame("bob", "sent it", "t"));

    assert_eq!(h.events.recv().await.unwrap(), SyncEvent::TypingChanged(None));
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => assert_eq!(message.body, "sent it"),
        other => panic!("expected TimelineAppended, got {other:?}"),
    }
    assert_eq!(h.sync.typing_author(), None);
}

#[tokio::test(start_paused = true)]
async fn own_echoed_chat_does_not_clear_another_users_indicator() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.connector.push_frame(typing_frame("bob"));
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::TypingChanged(Some("bob".to_string()))
    );

    // Alice's own message comes back while bob is still composing.
    h.connector.push_frame(chat_frame("alice", "mine", "t"));

    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => assert_eq!(message.body, "mine"),
        other => panic!("expected TimelineAppended, got {other:?}"),
    }
    assert_eq!(h.sync.typing_author().as_deref(), Some("bob"));
}

// ════════════════════════════════════════════════════════════════════
// Outbound actions
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_chat_publishes_trimmed_text() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.sync.send_chat("  hello there  ").unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = h.connector.sent.lock().unwrap();
    let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"type": "chat", "message": "hello there"})
    );
}

#[tokio::test]
async fn send_chat_rejects_blank_text() {
    let h = harness(vec![]);
    let err = h.sync.send_chat("   ").unwrap_err();
    assert!(matches!(err, ParlorError::Validation { .. }));
}

#[tokio::test]
async fn send_chat_before_activation_reports_not_connected() {
    let h = harness(vec![]);
    let err = h.sync.send_chat("hello").unwrap_err();
    assert!(matches!(err, ParlorError::NotConnected));
}

#[tokio::test]
async fn notify_typing_carries_the_local_username() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    h.sync.notify_typing();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = h.connector.sent.lock().unwrap();
    let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(value, serde_json::json!({"type": "typing", "user": "alice"}));
}

#[tokio::test]
async fn notify_typing_without_connection_is_silent() {
    let h = harness(vec![]);
    // Must not panic or error.
    h.sync.notify_typing();
}

// ════════════════════════════════════════════════════════════════════
// End to end
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_session_create_room_and_chat_flow() {
    let exchange = ScriptedExchange::new(vec![
        ok(r#"{"session_id":"s-alice","username":"alice","joined_rooms":[]}"#),
        ok(r#"{"room_id":"R1"}"#),
        ok(&session_json("alice", &[])),
        ok("{}"), // existence probe
        ok(&history_json(&[])),
        ok(&rooms_json(&[])),
        ok("{}"), // implicit join of the freshly created room
    ]);
    let credentials = CredentialStore::new();
    let transport = AuthenticatedTransport::new(exchange.clone(), credentials.clone());
    let directory = SessionDirectory::new(transport);
    let connector = MockConnector::new();
    let channel = RealtimeChannel::new(connector.clone(), credentials.clone());

    directory.create_session("alice").await.unwrap();
    let room = directory.create_room().await.unwrap();
    assert_eq!(room, "R1");

    let (mut sync, mut events) =
        ChatRoomSynchronizer::new(directory, channel, SyncConfig::new());
    sync.activate(&room).await.unwrap();
    drain_activation(&mut events, 0).await;

    sync.send_chat("hi").unwrap();
    // The server echoes the message back on the channel.
    connector.push_frame(chat_frame("alice", "hi", "2024-01-01T00:00:00Z"));

    match events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => {
            assert_eq!(message.author, "alice");
            assert_eq!(message.body, "hi");
        }
        other => panic!("expected TimelineAppended, got {other:?}"),
    }
    assert_eq!(sync.rooms(), vec!["R1".to_string()]);
    assert_eq!(sync.timeline().len(), 1);
}

// ════════════════════════════════════════════════════════════════════
// Leaving rooms
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leaving_the_active_room_tears_the_session_down() {
    let mut h = harness(member_activation("alice", &["lobby", "side"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;
    h.exchange.push_response(ok("{}")); // DELETE /sessions/me

    h.sync.leave_room("lobby").await.unwrap();

    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::Redirect(RedirectReason::SignedOut)
    );
    assert!(h.exchange.paths().contains(&"/sessions/me".to_string()));
    assert_eq!(h.credentials.get(), None);
    assert!(h.connector.closed_flags.lock().unwrap()[0].load(Ordering::Relaxed));
    assert_eq!(h.sync.active_room(), None);
}

#[tokio::test]
async fn leaving_the_last_room_redirects_with_no_rooms_left() {
    let mut h = harness(member_activation("alice", &["lobby"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;
    h.exchange.push_response(ok("{}")); // DELETE /sessions/me

    h.sync.leave_room("lobby").await.unwrap();

    // No other membership remains, so the redirect says so.
    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::Redirect(RedirectReason::NoRoomsLeft)
    );
    assert_eq!(h.credentials.get(), None);
}

#[tokio::test]
async fn leaving_another_room_only_updates_membership() {
    let mut h = harness(member_activation("alice", &["lobby", "side"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;
    h.exchange.push_response(ok("{}")); // DELETE /rooms/side/leave

    h.sync.leave_room("side").await.unwrap();

    assert_eq!(
        h.events.recv().await.unwrap(),
        SyncEvent::RoomListChanged(vec!["lobby".to_string()])
    );
    assert!(h.exchange.paths().contains(&"/rooms/side/leave".to_string()));
    // The realtime connection to the active room is untouched.
    assert!(!h.connector.closed_flags.lock().unwrap()[0].load(Ordering::Relaxed));
    assert_eq!(h.sync.active_room().as_deref(), Some("lobby"));
}

#[tokio::test]
async fn reactivation_replaces_the_previous_room() {
    let mut h = harness(member_activation("alice", &["lobby", "side"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    // Second activation against the same scripted surface.
    for response in member_activation("alice", &["lobby", "side"], &history_json(&[])) {
        h.exchange.push_response(response);
    }
    h.sync.activate("side").await.unwrap();

    // The first connection got closed, the second is live.
    assert!(h.connector.closed_flags.lock().unwrap()[0].load(Ordering::Relaxed));
    assert_eq!(h.connector.dialed.lock().unwrap().len(), 2);
    assert_eq!(h.sync.active_room().as_deref(), Some("side"));
    assert!(h.sync.timeline().is_empty());
}

#[tokio::test]
async fn room_switch_does_not_signal_disconnect() {
    let mut h = harness(member_activation("alice", &["lobby", "side"], &history_json(&[])));
    h.sync.activate("lobby").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    for response in member_activation("alice", &["lobby", "side"], &history_json(&[])) {
        h.exchange.push_response(response);
    }
    h.sync.activate("side").await.unwrap();
    drain_activation(&mut h.events, 0).await;

    // Retiring the old room's connection is invisible to observers: the
    // next event after a successful switch is live traffic, never
    // ConnectionClosed.
    h.connector.push_frame(chat_frame("bob", "fresh room", "t"));
    match h.events.recv().await.unwrap() {
        SyncEvent::TimelineAppended(message) => assert_eq!(message.body, "fresh room"),
        other => panic!("unexpected event after room switch: {other:?}"),
    }
}
