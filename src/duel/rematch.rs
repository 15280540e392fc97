use super::{DuelClient, DuelEvent, Writer};
use crate::error::{DuelError, DuelResult};
use crate::types::{SessionRecord, SessionStatus};
use tokio::time::Instant;

impl DuelClient {
    /// Ask for another game. Idempotent; the game restarts once both players asked.
    pub async fn request_rematch(&mut self) -> DuelResult<()> {
        self.ensure_open()?;
        if self.winner.is_none() {
            return Err(DuelError::InvalidState(
                "rematch is only possible after game over".to_string(),
            ));
        }
        if self.rematch.requested {
            return Ok(());
        }

        self.rematch.requested = true;
        if let Err(e) = self
            .store
            .patch(&self.key, self.writer.request_rematch())
            .await
        {
            self.rematch.requested = false;
            return Err(e.into());
        }
        tracing::info!("{} wants a rematch in session {}", self.name, self.code);
        Ok(())
    }

    pub(super) async fn track_rematch(
        &mut self,
        record: &SessionRecord,
        now: Instant,
        events: &mut Vec<DuelEvent>,
    ) -> DuelResult<()> {
        let opponent = self.role().opponent();
        if !record.wants_rematch(opponent) {
            self.rematch.opponent_announced = false;
        } else if !self.rematch.opponent_announced {
            self.rematch.opponent_announced = true;
            if !self.rematch.requested {
                events.push(DuelEvent::RematchRequested);
            }
        }

        let both = record.rematch_host && record.rematch_guest;
        if !both {
            self.rematch.restart_handled = false;
            // The host already restarted and we never saw both flags set
            if self.winner.is_some()
                && self.rematch.requested
                && !record.game_over
                && record.status == SessionStatus::Playing
            {
                self.reset_for_rematch();
                events.push(DuelEvent::RematchStarted);
            }
            return Ok(());
        }
        if !record.game_over || self.rematch.restart_handled {
            return Ok(());
        }

        self.rematch.restart_handled = true;
        self.reset_for_rematch();
        if let Writer::Host(host) = self.writer {
            if let Err(e) = self.store.patch(&self.key, host.restart()).await {
                self.rematch.restart_handled = false;
                return Err(e.into());
            }
            self.started = true;
            self.next_question_at = Some(now + self.config.start_delay);
        }
        tracing::info!("Rematch started in session {}", self.code);
        events.push(DuelEvent::RematchStarted);
        Ok(())
    }

    /// Local game state back to zero. Round ids keep counting up so answers
    /// from the previous game can never match a new question.
    fn reset_for_rematch(&mut self) {
        self.own_score = 0;
        self.opponent_score = 0;
        self.winner = None;
        self.finish_written = false;
        self.game_over_announced = false;
        self.round = None;
        self.next_question_at = None;
        self.rematch.requested = false;
        self.rematch.opponent_announced = false;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{playing_pair, pump, Pair};
    use super::*;
    use crate::config::DuelConfig;
    use crate::types::{session_key, Role};

    /// Host wins 1:0 with a margin of one
    async fn finished_pair() -> Pair {
        let config = DuelConfig {
            win_margin: 1,
            ..DuelConfig::immediate()
        };
        let mut pair = playing_pair(config).await;
        let answer = pair.host.current_question().unwrap().answer().to_string();
        pair.host.submit_answer(&answer, Instant::now()).await.unwrap();
        pump(&mut pair.host, &mut pair.host_sub).await;
        pump(&mut pair.guest, &mut pair.guest_sub).await;
        assert_eq!(pair.guest.winner(), Some(Role::Host));
        pair
    }

    #[tokio::test]
    async fn test_rematch_requires_game_over() {
        let mut pair = playing_pair(DuelConfig::immediate()).await;
        assert!(matches!(
            pair.guest.request_rematch().await,
            Err(DuelError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_one_sided_rematch_does_not_restart() {
        let mut pair = finished_pair().await;

        pair.host.request_rematch().await.unwrap();
        pair.host.request_rematch().await.unwrap();
        pump(&mut pair.host, &mut pair.host_sub).await;
        let events = pump(&mut pair.guest, &mut pair.guest_sub).await;
        assert_eq!(events, vec![DuelEvent::RematchRequested]);

        let record = pair.store.get(&session_key(pair.host.code())).await.unwrap();
        assert!(record.rematch_host);
        assert!(!record.rematch_guest);
        assert!(record.game_over);
        assert_eq!(record.status, SessionStatus::Ended);
        assert_eq!(pair.host.winner(), Some(Role::Host));
    }

    #[tokio::test]
    async fn test_mutual_rematch_restarts_game() {
        let mut pair = finished_pair().await;

        pair.host.request_rematch().await.unwrap();
        pair.guest.request_rematch().await.unwrap();

        let host_events = pump(&mut pair.host, &mut pair.host_sub).await;
        assert!(host_events.contains(&DuelEvent::RematchStarted));
        let guest_events = pump(&mut pair.guest, &mut pair.guest_sub).await;
        assert_eq!(
            guest_events
                .iter()
                .filter(|e| **e == DuelEvent::RematchStarted)
                .count(),
            1
        );
        assert!(!guest_events
            .iter()
            .any(|e| matches!(e, DuelEvent::GameOver { .. })));

        let record = pair.store.get(&session_key(pair.host.code())).await.unwrap();
        assert_eq!(record.status, SessionStatus::Playing);
        assert!(!record.game_over);
        assert!(record.winner.is_none());
        assert!(!record.rematch_host && !record.rematch_guest);
        assert_eq!((record.host_score, record.guest_score), (0, 0));
        assert!(record.current_question.is_none());

        assert_eq!(pair.host.scores(), (0, 0));
        assert_eq!(pair.guest.winner(), None);
        assert!(pair.host.next_deadline().is_some());

        // The new game continues the round numbering
        let question = pair.host.fire_due(Instant::now()).await.unwrap().unwrap();
        assert_eq!(question.issued_at, 2);
        let events = pump(&mut pair.guest, &mut pair.guest_sub).await;
        assert!(events.contains(&DuelEvent::NewRound(question)));
    }
}
