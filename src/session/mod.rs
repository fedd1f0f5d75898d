//! Conversation sessions: ordered history plus a single-flight guard.
//!
//! One [`ConversationSession`] is live per logical user session, kept in a
//! keyed [`SessionStore`] and created on first interaction. The guard is an
//! atomic compare-exchange, so two parallel requests can never both observe
//! an idle session, and release happens in `Drop` so every exit path
//! (success, failure, panic) returns the session to `Idle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single history entry. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// RFC 3339 wall-clock timestamp, for rendering only.
    pub timestamp: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// ─── Session state machine ───────────────────────────────────────────────────

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Processing,
}

struct SessionInner {
    id: String,
    history: Vec<Message>,
}

/// Bit 0 of `flight`: a request is in flight. Bits 1..: the reset epoch.
const PROCESSING_BIT: u64 = 1;

/// Per-session state: ordered message history + single-flight guard.
///
/// The guard flag and the reset epoch are packed into one `flight` word so
/// acquisition, release, and reset are each a single compare-exchange; a
/// reset can never slip in between reading one and writing the other. The
/// epoch increments on every reset; a flight that started before a reset
/// carries the old epoch and its result is discarded instead of being
/// applied to the fresh session.
pub struct ConversationSession {
    flight: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            flight: AtomicU64::new(0),
            inner: Mutex::new(SessionInner {
                id: id.into(),
                history: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.flight.load(Ordering::SeqCst) & PROCESSING_BIT != 0 {
            SessionState::Processing
        } else {
            SessionState::Idle
        }
    }

    fn current_epoch(&self) -> u64 {
        self.flight.load(Ordering::SeqCst) >> 1
    }

    pub async fn id(&self) -> String {
        self.inner.lock().await.id.clone()
    }

    /// Snapshot of the ordered history for rendering.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.history.clone()
    }

    /// Try to enter `Processing`. Returns `None` if a request is already in
    /// flight for this session.
    ///
    /// The flag is set and the epoch captured from the same word in one
    /// compare-exchange; a reset interleaving with acquisition makes the
    /// exchange fail and the loop re-reads the post-reset state.
    pub fn try_begin(self: &Arc<Self>) -> Option<FlightGuard> {
        let mut cur = self.flight.load(Ordering::SeqCst);
        loop {
            if cur & PROCESSING_BIT != 0 {
                return None;
            }
            match self.flight.compare_exchange(
                cur,
                cur | PROCESSING_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(FlightGuard {
                        session: Arc::clone(self),
                        epoch: cur >> 1,
                    });
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Append a message, unless the session was reset since `epoch` was
    /// captured. Returns whether the message was applied.
    ///
    /// The epoch is checked under the history lock; `reset` bumps it while
    /// holding the same lock, so a stale flight can never push into a
    /// freshly cleared history.
    pub async fn append(&self, epoch: u64, message: Message) -> bool {
        let mut inner = self.inner.lock().await;
        if self.current_epoch() != epoch {
            return false;
        }
        inner.history.push(message);
        true
    }

    /// Remove the most recent message if it is a User message. This is the
    /// failure rollback: the user's text never reached the assistant, so it
    /// is taken back out of the record for them to resend.
    pub async fn rollback_last_user(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if self.current_epoch() != epoch {
            return;
        }
        if inner.history.last().is_some_and(|m| m.role == Role::User) {
            inner.history.pop();
        }
    }

    /// Forcibly return to `Idle` with empty history and a fresh id.
    ///
    /// Any in-flight call keeps the old epoch: its eventual result is
    /// discarded and its guard will not release the fresh session.
    pub async fn reset(&self) -> String {
        let new_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().await;
        // Bump the epoch and clear the flag in one atomic update.
        let _ = self
            .flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(((cur >> 1) + 1) << 1)
            });
        inner.history.clear();
        inner.id = new_id.clone();
        new_id
    }
}

/// Releases the single-flight guard on drop.
///
/// Epoch-tagged: if the session was reset while this flight was outstanding,
/// the reset already released the flag (and a newer flight may hold it), so
/// a stale guard must not touch it.
pub struct FlightGuard {
    session: Arc<ConversationSession>,
    epoch: u64,
}

impl FlightGuard {
    /// The epoch this flight belongs to; history mutations carry it so a
    /// reset in between invalidates them.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Clears the flag only if no reset happened since acquisition; the
        // exchange fails harmlessly for a stale guard.
        let _ = self.session.flight.compare_exchange(
            (self.epoch << 1) | PROCESSING_BIT,
            self.epoch << 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Keyed store mapping session ids to live sessions.
///
/// Sessions are created on first interaction and replaced (not mutated in
/// place) on reset, so a reset always yields a new session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<ConversationSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ConversationSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<ConversationSession> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return session.clone();
        }
        let mut map = self.sessions.write().await;
        // Re-check under the write lock; another task may have created it.
        if let Some(session) = map.get(id) {
            return session.clone();
        }
        let session = Arc::new(ConversationSession::new(id));
        map.insert(id.to_string(), session.clone());
        info!(session_id = %id, "session created");
        session
    }

    /// Reset a session: clear its history, invalidate any in-flight call,
    /// and re-key it under a freshly generated id. Returns the new id.
    ///
    /// Resetting an unknown (or absent) id still creates a fresh session,
    /// so the caller always gets a usable id back.
    pub async fn reset(&self, old_id: Option<&str>) -> String {
        let mut map = self.sessions.write().await;
        let session = old_id
            .and_then(|id| map.remove(id))
            .unwrap_or_else(|| Arc::new(ConversationSession::new("")));
        let new_id = session.reset().await;
        map.insert(new_id.clone(), session);
        info!(old_id = ?old_id, new_id = %new_id, "session reset");
        new_id
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_flight_rejects_second_begin() {
        let session = Arc::new(ConversationSession::new("s1"));
        let guard = session.try_begin().expect("first begin succeeds");
        assert_eq!(session.state(), SessionState::Processing);
        assert!(session.try_begin().is_none(), "second begin must fail");
        drop(guard);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.try_begin().is_some());
    }

    #[tokio::test]
    async fn rollback_removes_only_trailing_user_message() {
        let session = Arc::new(ConversationSession::new("s1"));
        let guard = session.try_begin().unwrap();
        let epoch = guard.epoch();
        assert!(session.append(epoch, Message::user("hi")).await);
        assert!(session.append(epoch, Message::assistant("hello")).await);
        session.rollback_last_user(epoch).await;
        assert_eq!(session.history().await.len(), 2, "assistant tail is kept");

        assert!(session.append(epoch, Message::user("again")).await);
        session.rollback_last_user(epoch).await;
        assert_eq!(session.history().await.len(), 2, "trailing user message removed");
    }

    #[tokio::test]
    async fn reset_discards_stale_flight_results() {
        let session = Arc::new(ConversationSession::new("s1"));
        let guard = session.try_begin().unwrap();
        let stale_epoch = guard.epoch();
        assert!(session.append(stale_epoch, Message::user("hi")).await);

        session.reset().await;
        assert!(
            !session.append(stale_epoch, Message::assistant("late reply")).await,
            "stale result must be discarded"
        );
        assert!(session.history().await.is_empty());

        // The fresh session is usable immediately; the stale guard's drop
        // must not release a newer flight's flag.
        let fresh = session.try_begin().expect("fresh session is idle");
        drop(guard);
        assert_eq!(session.state(), SessionState::Processing);
        drop(fresh);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn begin_racing_reset_never_writes_into_fresh_history() {
        // Race acquisition against reset many times. Whatever the
        // interleaving, an append that the reset invalidated must report
        // unapplied, the fresh history must not contain it, and the session
        // must end up acquirable (no flag leaked by a stale guard).
        for _ in 0..500 {
            let session = Arc::new(ConversationSession::new("s"));
            let flight = {
                let s = Arc::clone(&session);
                tokio::spawn(async move {
                    match s.try_begin() {
                        Some(guard) => s.append(guard.epoch(), Message::user("turn")).await,
                        None => false,
                    }
                })
            };
            let reset = {
                let s = Arc::clone(&session);
                tokio::spawn(async move { s.reset().await })
            };
            let applied = flight.await.unwrap();
            reset.await.unwrap();

            let history = session.history().await;
            if !applied {
                assert!(history.is_empty(), "unapplied append must leave no trace");
            }
            // Applied means the flight either completed before the reset
            // (history cleared) or began after it (at most one message).
            assert!(history.len() <= 1);
            assert_eq!(session.state(), SessionState::Idle);
            assert!(session.try_begin().is_some(), "session must stay acquirable");
        }
    }

    #[tokio::test]
    async fn store_reset_is_idempotent_with_distinct_ids() {
        let store = SessionStore::new();
        let session = store.get_or_create("orig").await;
        let g = session.try_begin().unwrap();
        session.append(g.epoch(), Message::user("hi")).await;
        drop(g);

        let id1 = store.reset(Some("orig")).await;
        let id2 = store.reset(Some(&id1)).await;
        assert_ne!(id1, id2);
        assert!(store.get("orig").await.is_none());

        let fresh = store.get(&id2).await.unwrap();
        assert!(fresh.history().await.is_empty());
        assert_eq!(fresh.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_session() {
        let store = SessionStore::new();
        let a = store.get_or_create("s").await;
        let b = store.get_or_create("s").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.count().await, 1);
    }
}
