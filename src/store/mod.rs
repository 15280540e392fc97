//! Remote session store abstraction
//!
//! The duel protocol only ever talks to a document store keyed by string,
//! with change subscriptions and a store-side "on disconnect" patch. Delivery
//! is at-least-once and there are no transactions, so every consumer has to
//! tolerate redelivered snapshots.

mod memory;
mod remote;

use crate::types::{AnswerRecord, Question, Role, SessionRecord, SessionStatus};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub use memory::{ConnectionId, MemoryConnection, MemoryStore};
pub use remote::RemoteStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no record at {0}")]
    NotFound(String),

    #[error("connection to store lost")]
    Disconnected,

    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// A single field assignment on a session record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum FieldUpdate {
    GuestName(Option<String>),
    HostConnected(bool),
    GuestConnected(bool),
    Status(SessionStatus),
    CurrentQuestion(Option<Question>),
    HostScore(u32),
    GuestScore(u32),
    HostAnswer(Option<AnswerRecord>),
    GuestAnswer(Option<AnswerRecord>),
    GameOver(bool),
    Winner(Option<Role>),
    RematchHost(bool),
    RematchGuest(bool),
}

impl FieldUpdate {
    fn apply(&self, record: &mut SessionRecord) {
        match self {
            FieldUpdate::GuestName(v) => record.guest_name = v.clone(),
            FieldUpdate::HostConnected(v) => record.host_connected = *v,
            FieldUpdate::GuestConnected(v) => record.guest_connected = *v,
            FieldUpdate::Status(v) => record.status = *v,
            FieldUpdate::CurrentQuestion(v) => record.current_question = v.clone(),
            FieldUpdate::HostScore(v) => record.host_score = *v,
            FieldUpdate::GuestScore(v) => record.guest_score = *v,
            FieldUpdate::HostAnswer(v) => record.host_answer = v.clone(),
            FieldUpdate::GuestAnswer(v) => record.guest_answer = v.clone(),
            FieldUpdate::GameOver(v) => record.game_over = *v,
            FieldUpdate::Winner(v) => record.winner = *v,
            FieldUpdate::RematchHost(v) => record.rematch_host = *v,
            FieldUpdate::RematchGuest(v) => record.rematch_guest = *v,
        }
    }
}

/// Partial update of a session record, applied field by field (last write wins)
///
/// Patches are built by the role-scoped writers in `duel::ownership`, which is
/// where field ownership is enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Patch(Vec<FieldUpdate>);

impl Patch {
    pub(crate) fn new(updates: Vec<FieldUpdate>) -> Self {
        Self(updates)
    }

    pub fn updates(&self) -> &[FieldUpdate] {
        &self.0
    }

    /// Append another patch; later updates win when fields repeat
    pub fn merge(&mut self, other: Patch) {
        self.0.extend(other.0);
    }

    pub fn apply(&self, record: &mut SessionRecord) {
        for update in &self.0 {
            update.apply(record);
        }
    }
}

/// Live feed of snapshots. Dropping the subscription (or calling
/// `unsubscribe`) cancels it at the store.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Wait for the next snapshot; `None` once the store side has gone away
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Feed of a single record; `None` means the record does not (or no longer) exist
pub type RecordSubscription = Subscription<Option<SessionRecord>>;

/// Feed of every record under a key prefix
pub type CollectionSubscription = Subscription<Vec<SessionRecord>>;

/// Operations the duel protocol consumes from the remote store.
///
/// Each implementation value represents one client connection: cleanup
/// patches registered through it fire when that connection drops.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or replace the record at `key`
    async fn write(&self, key: &str, record: SessionRecord) -> StoreResult<()>;

    /// Apply a partial update; fails with `NotFound` if no record exists
    async fn patch(&self, key: &str, patch: Patch) -> StoreResult<()>;

    async fn read(&self, key: &str) -> StoreResult<Option<SessionRecord>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Current snapshot first, then one snapshot per change
    async fn subscribe(&self, key: &str) -> StoreResult<RecordSubscription>;

    /// All records whose key starts with `prefix`, resent on every change
    async fn subscribe_collection(&self, prefix: &str) -> StoreResult<CollectionSubscription>;

    /// Have the store apply `patch` to `key` if this connection drops
    async fn register_cleanup_on_disconnect(&self, key: &str, patch: Patch) -> StoreResult<()>;

    /// Withdraw every cleanup patch this connection registered for `key`
    async fn cancel_cleanup_on_disconnect(&self, key: &str) -> StoreResult<()>;
}
