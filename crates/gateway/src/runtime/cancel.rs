//! Per-session cancellation tokens.
//!
//! Each running turn task gets a [`CancelToken`]. Setting it is how the
//! gateway implements both the `interrupt` frame and "a new `chat` frame
//! cancels any turn still in progress" (§4.6): the flag is read at every
//! stream-event boundary inside the Streaming Turn Engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation flag shared between the session task that owns it and the
/// turn task reading it.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether `self` and `other` share the same underlying flag (i.e. are
    /// clones of the token for the same turn), as opposed to two distinct
    /// turns that happen to both be unset.
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the single active turn's cancel token per session.
///
/// Exactly one turn task is active per session at a time (§5 Scheduling
/// model), so registering a new token implicitly orphans the previous one —
/// the gateway calls [`CancelMap::cancel`] first to stop it before
/// [`CancelMap::register`]-ing the replacement.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `session_id`'s next turn, replacing any
    /// previous one.
    pub fn register(&self, session_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(session_id, token.clone());
        token
    }

    /// Cancel the active turn for a session, if any. Returns whether a
    /// token was found.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.tokens.lock().get(&session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once a turn completes (success, error, or interrupt).
    pub fn remove(&self, session_id: Uuid) {
        self.tokens.lock().remove(&session_id);
    }

    /// Drop the token for `session_id` only if it's still `token` — i.e. no
    /// newer turn has replaced it since the caller's turn started. A turn
    /// task that finishes after being superseded by a fresher `chat` frame
    /// must not clobber the replacement's entry.
    pub fn remove_if_current(&self, session_id: Uuid, token: &CancelToken) {
        let mut tokens = self.tokens.lock();
        if tokens.get(&session_id).is_some_and(|current| current.same(token)) {
            tokens.remove(&session_id);
        }
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&session_id)
    }
}
