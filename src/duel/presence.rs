use super::{DuelClient, DuelEvent, Writer};
use crate::error::DuelResult;
use crate::store::StoreError;
use crate::types::{SessionRecord, SessionStatus};

impl DuelClient {
    /// Leave the session on purpose.
    ///
    /// The host removes the whole record; the guest only marks itself gone.
    /// Either way the disconnect cleanup is cancelled so the store does not
    /// apply it later. Runs at most once.
    pub async fn leave(&mut self) -> DuelResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.next_question_at = None;

        let result = match self.writer {
            Writer::Host(_) => {
                let cancelled = self.store.cancel_cleanup_on_disconnect(&self.key).await;
                let deleted = self.store.delete(&self.key).await;
                cancelled.and(deleted)
            }
            Writer::Guest(guest) => {
                let left = match self.store.patch(&self.key, guest.leave()).await {
                    Err(StoreError::NotFound(_)) => Ok(()),
                    other => other,
                };
                let cancelled = self.store.cancel_cleanup_on_disconnect(&self.key).await;
                left.and(cancelled)
            }
        };

        tracing::info!("{} left session {}", self.name, self.code);
        result.map_err(Into::into)
    }

    /// Our own store link is gone; nothing more can be written
    pub(crate) fn mark_closed(&mut self) {
        if !self.closed {
            tracing::warn!("Lost store connection for session {}", self.code);
        }
        self.closed = true;
        self.next_question_at = None;
    }

    /// The opponent's presence flag went false after they had joined
    pub(super) fn opponent_dropped(&self, record: &SessionRecord) -> bool {
        record.status != SessionStatus::Waiting && !record.connected(self.role().opponent())
    }

    pub(super) async fn handle_opponent_drop(&mut self) {
        tracing::info!("Opponent left session {}", self.code);
        if let Err(e) = self.leave().await {
            tracing::warn!("Cleanup after opponent left {} failed: {}", self.code, e);
        }
    }

    /// The record was deleted, normally because the host left
    pub(super) async fn handle_vanished(&mut self) -> Vec<DuelEvent> {
        if self.record.take().is_none() {
            return Vec::new();
        }
        tracing::info!("Session {} no longer exists", self.code);
        if let Err(e) = self.leave().await {
            tracing::warn!("Cleanup after {} vanished failed: {}", self.code, e);
        }
        vec![DuelEvent::OpponentDisconnected]
    }
}
