//! Live list of sessions a player can join without knowing the code

use crate::error::DuelResult;
use crate::store::{CollectionSubscription, SessionStore};
use crate::types::{SessionRecord, SESSIONS_PREFIX};
use futures::stream::{Map, StreamExt};

/// Stream of open-session lists; each item replaces the previous one
pub type OpenSessions =
    Map<CollectionSubscription, fn(Vec<SessionRecord>) -> Vec<SessionRecord>>;

/// Joinable sessions (waiting, host present, not private), newest first
pub fn open_sessions(records: Vec<SessionRecord>) -> Vec<SessionRecord> {
    let mut open: Vec<SessionRecord> = records.into_iter().filter(|r| r.is_open()).collect();
    open.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.code.as_str().cmp(b.code.as_str()))
    });
    open
}

/// Subscribe to the open sessions. The first item arrives right away; a new
/// one follows every change to any session. Drop the stream to unsubscribe.
pub async fn list_open_sessions(store: &dyn SessionStore) -> DuelResult<OpenSessions> {
    let subscription = store.subscribe_collection(SESSIONS_PREFIX).await?;
    Ok(subscription.map(open_sessions as fn(Vec<SessionRecord>) -> Vec<SessionRecord>))
}
