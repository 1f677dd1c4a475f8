//! # Parlor Client
//!
//! Transport-agnostic Rust client for the Parlor multi-room chat protocol.
//!
//! This crate keeps a local, observable view of multi-room chat state
//! consistent with a remote Parlor server across two surfaces: a REST
//! directory (sessions, rooms, history snapshots) and a per-room realtime
//! channel carrying JSON text frames.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] trait for any backend
//! - **WebSocket built-in** — default `transport-websocket` feature provides `WebSocketTransport`
//! - **Event-driven** — observe typed [`SyncEvent`] diffs via a channel
//! - **Ordered timeline** — history and live messages never interleave out of order
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                ChatRoomSynchronizer                  │
//! │  timeline · room list · typing indicator · events    │
//! └───────┬──────────────────────────────────┬───────────┘
//!         │ REST                             │ realtime
//! ┌───────▼─────────┐               ┌────────▼──────────┐
//! │ SessionDirectory │               │  RealtimeChannel  │
//! │ (sessions/rooms) │               │  (pub/sub frames) │
//! └───────┬─────────┘               └────────┬──────────┘
//! ┌───────▼──────────────┐          ┌────────▼──────────┐
//! │ AuthenticatedTransport│          │  dyn Transport    │
//! │  (bearer + 401 rule)  │          │  (WebSocket, …)   │
//! └───────┬──────────────┘          └───────────────────┘
//!         └───────── shared CredentialStore ─────────────
//! ```
//!
//! Both surfaces authenticate with one session credential held in a
//! shared [`CredentialStore`]; an authorization rejection anywhere clears
//! it so no layer keeps acting on a dead session.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use parlor_client::{
//!     AuthenticatedTransport, ChatRoomSynchronizer, CredentialStore, RealtimeChannel,
//!     ReqwestExchange, SessionDirectory, SyncConfig, SyncEvent,
//! };
//! use parlor_client::transports::WebSocketConnector;
//!
//! # async fn run() -> parlor_client::Result<()> {
//! let credentials = CredentialStore::new();
//! let transport = AuthenticatedTransport::new(
//!     Arc::new(ReqwestExchange::new("https://chat.example.com")),
//!     credentials.clone(),
//! );
//! let directory = SessionDirectory::new(transport);
//! let channel = RealtimeChannel::new(
//!     Arc::new(WebSocketConnector::new("wss://chat.example.com")),
//!     credentials,
//! );
//!
//! directory.create_session("alice").await?;
//!
//! let (mut sync, mut events) = ChatRoomSynchronizer::new(directory, channel, SyncConfig::new());
//! sync.activate("lobby").await?;
//! sync.send_chat("hello!")?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SyncEvent::TimelineAppended(message) => println!("{}: {}", message.author, message.body),
//!         SyncEvent::Redirect(reason) => {
//!             eprintln!("redirected: {reason:?}");
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod http;
pub mod protocol;
pub mod sync;
pub mod transport;
pub mod transports;

pub use channel::{ChannelConnector, ChannelEvent, ChannelState, EventKind, RealtimeChannel, Subscription};
pub use credentials::{CredentialSlot, CredentialStore, MemorySlot};
pub use directory::{Session, SessionDirectory};
pub use error::{ParlorError, Result};
pub use http::{AuthenticatedTransport, HttpExchange, HttpRequest, HttpResponse, Method, ReqwestExchange};
pub use protocol::{ClientFrame, Message, MessageKind, RoomId, ServerFrame};
pub use sync::{ChatRoomSynchronizer, RedirectReason, SyncConfig, SyncEvent};
pub use transport::Transport;
