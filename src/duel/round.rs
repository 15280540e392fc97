use super::question::{self, Evaluation};
use super::{ActiveRound, AnswerOutcome, DuelClient, DuelEvent, Writer};
use crate::error::{DuelError, DuelResult};
use crate::types::{AnswerRecord, Question, Role, SessionRecord};
use tokio::time::Instant;

/// Who has won, if either score leads the other by at least `margin`
pub fn winner_for(host_score: u32, guest_score: u32, margin: u32) -> Option<Role> {
    let margin = margin.max(1);
    if host_score >= guest_score.saturating_add(margin) {
        Some(Role::Host)
    } else if guest_score >= host_score.saturating_add(margin) {
        Some(Role::Guest)
    } else {
        None
    }
}

impl DuelClient {
    /// Host only: issue a fresh question with the next `issued_at`
    pub async fn generate_question(&mut self) -> DuelResult<Question> {
        self.ensure_open()?;
        let Writer::Host(host) = self.writer else {
            return Err(DuelError::NotHost("issue questions"));
        };
        if !self.started {
            return Err(DuelError::InvalidState("game has not started".to_string()));
        }
        if self.winner.is_some() {
            return Err(DuelError::InvalidState("game is over".to_string()));
        }
        let operations = match &self.record {
            Some(record) => record.allowed_operations.clone(),
            None => return Err(DuelError::SessionClosed),
        };

        self.issue_counter += 1;
        let question = question::generate(
            &mut self.rng,
            &operations,
            self.issue_counter,
            self.config.wide_multiply_percent,
        );
        self.next_question_at = None;
        self.store
            .patch(&self.key, host.issue_question(question.clone()))
            .await?;

        tracing::debug!(
            "Session {} question #{}: {}",
            self.code,
            question.issued_at,
            question
        );
        Ok(question)
    }

    /// Check the current input. Only a correct answer writes to the store.
    pub async fn submit_answer(&mut self, raw: &str, now: Instant) -> DuelResult<AnswerOutcome> {
        self.ensure_open()?;
        if self.input_locked() {
            return Ok(AnswerOutcome::Ignored);
        }
        let Some(round) = self.round.as_mut() else {
            return Ok(AnswerOutcome::Ignored);
        };

        match question::evaluate(&round.question, raw) {
            Evaluation::Incomplete => return Ok(AnswerOutcome::Incomplete),
            Evaluation::Wrong => return Ok(AnswerOutcome::Wrong),
            Evaluation::Correct => {}
        }

        let latency_ms = now.saturating_duration_since(round.started_at).as_millis() as u64;
        let answer = AnswerRecord {
            correct: true,
            latency_ms,
            answered_at: round.question.issued_at,
        };
        round.answered = true;
        self.own_score += 1;

        let patch = self.writer.record_answer(self.own_score, answer);
        if let Err(e) = self.store.patch(&self.key, patch).await {
            self.own_score -= 1;
            if let Some(round) = self.round.as_mut() {
                round.answered = false;
            }
            return Err(e.into());
        }

        // The answer is stored; a failed finish write is retried on the next snapshot
        if let Err(e) = self.check_win().await {
            tracing::warn!("Session {} could not write the result: {}", self.code, e);
        }
        self.schedule_next_question(now);
        Ok(AnswerOutcome::Correct { latency_ms })
    }

    /// Host: issue the scheduled question once its time has come
    pub async fn fire_due(&mut self, now: Instant) -> DuelResult<Option<Question>> {
        match self.next_question_at {
            Some(at) if at <= now => {}
            _ => return Ok(None),
        }
        self.next_question_at = None;
        if self.closed || self.winner.is_some() {
            return Ok(None);
        }
        self.generate_question().await.map(Some)
    }

    /// Host: arm the next question unless one is already pending
    pub(super) fn schedule_next_question(&mut self, now: Instant) {
        if self.role() != Role::Host || self.winner.is_some() || self.next_question_at.is_some() {
            return;
        }
        self.next_question_at = Some(now + self.config.next_question_delay);
    }

    /// Write the result once the margin is reached. Both sides may write it;
    /// the values are identical. The local winner is kept when the write
    /// fails, so the next call retries the write only.
    pub(super) async fn check_win(&mut self) -> DuelResult<()> {
        if self.finish_written {
            return Ok(());
        }
        let winner = match self.winner {
            Some(winner) => winner,
            None => {
                let (host_score, guest_score) = self.scores();
                let Some(winner) = winner_for(host_score, guest_score, self.config.win_margin)
                else {
                    return Ok(());
                };
                self.winner = Some(winner);
                self.next_question_at = None;
                tracing::info!(
                    "Session {} over: {:?} wins {}:{}",
                    self.code,
                    winner,
                    host_score,
                    guest_score
                );
                winner
            }
        };

        self.store
            .patch(&self.key, self.writer.finish(winner))
            .await?;
        self.finish_written = true;
        Ok(())
    }

    pub(super) fn track_question(
        &mut self,
        record: &SessionRecord,
        now: Instant,
        events: &mut Vec<DuelEvent>,
    ) {
        let Some(question) = &record.current_question else {
            self.round = None;
            return;
        };
        self.issue_counter = self.issue_counter.max(question.issued_at);

        if self.last_issued_at == Some(question.issued_at) {
            return;
        }
        if self.winner.is_some() {
            tracing::debug!(
                "Session {} ignoring question #{} after game over",
                self.code,
                question.issued_at
            );
            return;
        }

        self.last_issued_at = Some(question.issued_at);
        self.round = Some(ActiveRound {
            question: question.clone(),
            started_at: now,
            answered: false,
        });
        events.push(DuelEvent::NewRound(question.clone()));
    }

    /// Mirror the opponent's score from answers we have not seen yet. Returns
    /// true when the answer closes the current round.
    pub(super) fn track_opponent_answer(
        &mut self,
        record: &SessionRecord,
        events: &mut Vec<DuelEvent>,
    ) -> bool {
        let opponent = self.role().opponent();
        let Some(answer) = record.answer(opponent) else {
            return false;
        };
        if self
            .opponent_answered_at
            .is_some_and(|seen| answer.answered_at <= seen)
        {
            return false;
        }
        self.opponent_answered_at = Some(answer.answered_at);
        if !answer.correct {
            return false;
        }

        self.opponent_score = (self.opponent_score + 1).max(record.score(opponent));
        events.push(DuelEvent::OpponentScored {
            score: self.opponent_score,
        });
        // Answers to rounds the host has already replaced do not advance the game
        answer.answered_at >= self.issue_counter
    }

    pub(super) fn track_game_over(&mut self, record: &SessionRecord, events: &mut Vec<DuelEvent>) {
        // A restart is pending; the flags will be cleared together with game over
        if record.rematch_host && record.rematch_guest {
            return;
        }
        if !record.game_over || self.game_over_announced {
            return;
        }
        let Some(winner) = record.winner else {
            return;
        };

        let opponent = self.role().opponent();
        self.opponent_score = self.opponent_score.max(record.score(opponent));
        self.winner = Some(winner);
        self.finish_written = true;
        self.game_over_announced = true;
        self.next_question_at = None;
        events.push(DuelEvent::GameOver { winner });
    }
}
