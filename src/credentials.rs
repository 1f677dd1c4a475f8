//! Session credential storage.
//!
//! [`CredentialStore`] holds the single session token for the lifetime of
//! the process. It is cheaply cloneable — the REST transport, the realtime
//! channel, and the synchronizer all share the same store, so at most one
//! credential value exists at a time.
//!
//! The store is backed by a [`CredentialSlot`], a pluggable persistence
//! slot with the scope of one "tab" (one process by default). The slot is
//! consulted lazily: the first `get()` after construction rehydrates the
//! in-memory value from the slot, so a restarted process picks up a
//! previously persisted token.

use std::sync::{Arc, Mutex};

/// A tab-scoped persistence slot for the session credential.
///
/// The default [`MemorySlot`] keeps the token in memory only. Embedders
/// that have a real per-tab storage (a browser shell, a keyring, a temp
/// file) implement this trait and pass it to
/// [`CredentialStore::with_slot`].
pub trait CredentialSlot: Send + Sync + 'static {
    /// Read the persisted token, if any.
    fn load(&self) -> Option<String>;
    /// Persist the token.
    fn store(&self, token: &str);
    /// Remove the persisted token.
    fn discard(&self);
}

/// In-memory [`CredentialSlot`], the default backing.
#[derive(Debug, Default)]
pub struct MemorySlot {
    token: Mutex<Option<String>>,
}

impl CredentialSlot for MemorySlot {
    fn load(&self) -> Option<String> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }

    fn store(&self, token: &str) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(token.to_string());
        }
    }

    fn discard(&self) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = None;
        }
    }
}

struct Inner {
    /// `None` until the first rehydration from the slot.
    cached: Mutex<CacheState>,
    slot: Arc<dyn CredentialSlot>,
}

enum CacheState {
    /// The slot has not been consulted yet.
    Cold,
    /// The in-memory value is authoritative.
    Warm(Option<String>),
}

/// Shared handle to the process-wide session credential.
///
/// No validation is performed locally — validity is determined only by
/// server responses (see
/// [`AuthenticatedTransport`](crate::http::AuthenticatedTransport)).
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    /// Create a store backed by an in-memory slot.
    pub fn new() -> Self {
        Self::with_slot(Arc::new(MemorySlot::default()))
    }

    /// Create a store backed by a custom persistence slot.
    pub fn with_slot(slot: Arc<dyn CredentialSlot>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cached: Mutex::new(CacheState::Cold),
                slot,
            }),
        }
    }

    /// Store a new credential, replacing any previous one.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        self.inner.slot.store(&token);
        if let Ok(mut cached) = self.inner.cached.lock() {
            *cached = CacheState::Warm(Some(token));
        }
    }

    /// Return the current credential, rehydrating from the slot on the
    /// first call. Side-effect-free beyond that lazy rehydration.
    pub fn get(&self) -> Option<String> {
        let Ok(mut cached) = self.inner.cached.lock() else {
            return None;
        };
        match &*cached {
            CacheState::Warm(token) => token.clone(),
            CacheState::Cold => {
                let token = self.inner.slot.load();
                *cached = CacheState::Warm(token.clone());
                token
            }
        }
    }

    /// Clear the credential, both in memory and in the slot.
    pub fn clear(&self) {
        self.inner.slot.discard();
        if let Ok(mut cached) = self.inner.cached.lock() {
            *cached = CacheState::Warm(None);
        }
    }

    /// Returns `true` if a credential is currently held.
    pub fn is_authenticated(&self) -> bool {
        self.get().is_some()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
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

    #[test]
    fn get_reflects_last_set_not_followed_by_clear() {
        let store = CredentialStore::new();
        assert_eq!(store.get(), None);

        store.set("tok-1");
        assert_eq!(store.get().as_deref(), Some("tok-1"));

        store.set("tok-2");
        assert_eq!(store.get().as_deref(), Some("tok-2"));

        store.clear();
        assert_eq!(store.get(), None);

        store.set("tok-3");
        assert_eq!(store.get().as_deref(), Some("tok-3"));
    }

    #[test]
    fn get_is_idempotent() {
        let store = CredentialStore::new();
        store.set("tok");
        assert_eq!(store.get().as_deref(), Some("tok"));
        assert_eq!(store.get().as_deref(), Some("tok"));
    }

    #[test]
    fn rehydrates_from_slot_on_first_get() {
        let slot = Arc::new(MemorySlot::default());
        slot.store("persisted");

        // A fresh store simulates a restarted process sharing the slot.
        let store = CredentialStore::with_slot(slot);
        assert_eq!(store.get().as_deref(), Some("persisted"));
    }

    #[test]
    fn clear_discards_the_slot_value() {
        let slot = Arc::new(MemorySlot::default());
        let store = CredentialStore::with_slot(Arc::clone(&slot) as Arc<dyn CredentialSlot>);
        store.set("tok");
        store.clear();

        // A later store over the same slot must not resurrect the token.
        let revived = CredentialStore::with_slot(slot);
        assert_eq!(revived.get(), None);
    }

    #[test]
    fn clones_share_the_credential() {
        let store = CredentialStore::new();
        let other = store.clone();
        store.set("shared");
        assert_eq!(other.get().as_deref(), Some("shared"));
        other.clear();
        assert_eq!(store.get(), None);
    }

    #[test]
    fn is_authenticated_tracks_presence() {
        let store = CredentialStore::new();
        assert!(!store.is_authenticated());
        store.set("tok");
        assert!(store.is_authenticated());
        store.clear();
        assert!(!store.is_authenticated());
    }
}
