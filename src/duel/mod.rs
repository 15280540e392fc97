//! Duel session state machine
//!
//! A `DuelClient` is one player's view of a session. It never talks to the
//! other player; it writes its own fields to the store and reacts to every
//! snapshot the store delivers, including echoes of its own writes. All
//! handlers are idempotent against redelivery of the same snapshot.
//!
//! Lifecycle: waiting -> (guest joins) ready -> (host) playing -> rounds ->
//! (score gap reaches the win margin) ended -> (both want a rematch) playing.

mod ownership;
mod presence;
pub mod question;
mod rematch;
mod round;
mod runner;

use crate::config::DuelConfig;
use crate::error::{DuelError, DuelResult};
use crate::store::{RecordSubscription, SessionStore, StoreError};
use crate::types::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::time::Instant;

pub use ownership::{GuestWriter, HostWriter, Writer};
pub use round::winner_for;
pub use runner::{spawn, DuelHandle, DuelView};

/// Something the UI should react to
#[derive(Debug, Clone, PartialEq)]
pub enum DuelEvent {
    /// Host side: a guest took the open seat
    OpponentJoined { name: String },
    /// A question with a new `issued_at` arrived; input is re-armed
    NewRound(Question),
    OpponentScored { score: u32 },
    GameOver { winner: Role },
    /// The opponent asked for a rematch and is waiting for us
    RematchRequested,
    RematchStarted,
    /// The opponent dropped or left, or the session record vanished
    OpponentDisconnected,
    /// Our own link to the store is gone
    SessionClosed,
    Failed(DuelError),
}

/// Result of feeding the current input to `submit_answer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// No active round, input locked or game over
    Ignored,
    /// Not enough digits yet
    Incomplete,
    /// Clear the input and let the player try again; nothing was written
    Wrong,
    Correct { latency_ms: u64 },
}

#[derive(Debug, Clone)]
struct ActiveRound {
    question: Question,
    started_at: Instant,
    answered: bool,
}

#[derive(Debug, Clone, Default)]
struct RematchState {
    requested: bool,
    opponent_announced: bool,
    restart_handled: bool,
}

pub struct DuelClient {
    store: Arc<dyn SessionStore>,
    config: DuelConfig,
    code: SessionCode,
    key: String,
    name: String,
    writer: Writer,
    rng: StdRng,
    /// Latest snapshot; `None` once the record vanished
    record: Option<SessionRecord>,
    round: Option<ActiveRound>,
    /// `issued_at` of the last question processed as a new round
    last_issued_at: Option<IssuedAt>,
    /// Highest `issued_at` seen or written; the host issues above it
    issue_counter: IssuedAt,
    own_score: u32,
    /// Local mirror of the opponent's score, fed by their answers
    opponent_score: u32,
    opponent_answered_at: Option<u64>,
    opponent_joined: bool,
    /// Host has written `playing` for the current game
    started: bool,
    next_question_at: Option<Instant>,
    finish_written: bool,
    winner: Option<Role>,
    game_over_announced: bool,
    rematch: RematchState,
    closed: bool,
}

/// Trimmed display name, or a generated one when blank
fn display_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        petname::petname(2, " ").unwrap_or_else(|| "Anonymous".to_string())
    } else {
        trimmed.to_string()
    }
}

fn seeded_rng(config: &DuelConfig) -> StdRng {
    match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Pick a free code; a record whose host is gone counts as free
async fn allocate_code(store: &dyn SessionStore, rng: &mut StdRng) -> DuelResult<SessionCode> {
    let mut slots: Vec<u8> = (0..CODE_SPACE).collect();
    slots.shuffle(rng);

    for slot in slots {
        let code = SessionCode::from_index(slot);
        match store.read(&session_key(&code)).await? {
            None => return Ok(code),
            Some(existing) if !existing.host_connected => {
                tracing::debug!("Reusing abandoned session code {}", code);
                return Ok(code);
            }
            Some(_) => tracing::debug!("Session code {} in use, trying another", code),
        }
    }
    Err(DuelError::CodeSpaceExhausted)
}

impl DuelClient {
    fn new(
        store: Arc<dyn SessionStore>,
        config: DuelConfig,
        record: SessionRecord,
        name: String,
        writer: Writer,
        rng: StdRng,
    ) -> Self {
        let code = record.code.clone();
        Self {
            store,
            config,
            key: session_key(&code),
            code,
            name,
            writer,
            rng,
            record: Some(record),
            round: None,
            last_issued_at: None,
            issue_counter: 0,
            own_score: 0,
            opponent_score: 0,
            opponent_answered_at: None,
            opponent_joined: false,
            started: false,
            next_question_at: None,
            finish_written: false,
            winner: None,
            game_over_announced: false,
            rematch: RematchState::default(),
            closed: false,
        }
    }

    /// Host a new session. Returns the client and its record subscription;
    /// hand both to `spawn` (or drive `observe` yourself).
    pub async fn create(
        store: Arc<dyn SessionStore>,
        config: DuelConfig,
        host_name: &str,
        operations: &[Operation],
        is_private: bool,
    ) -> DuelResult<(Self, RecordSubscription)> {
        let mut operations = operations.to_vec();
        operations.sort();
        operations.dedup();
        if operations.is_empty() {
            return Err(DuelError::NoOperations);
        }

        let mut rng = seeded_rng(&config);
        let code = allocate_code(store.as_ref(), &mut rng).await?;
        let key = session_key(&code);
        let name = display_name(host_name);
        let writer = HostWriter;

        let record = SessionRecord::new(code.clone(), name.clone(), operations, is_private);
        store.write(&key, record.clone()).await?;
        store
            .register_cleanup_on_disconnect(&key, writer.presence_cleanup())
            .await?;
        let subscription = store.subscribe(&key).await?;

        tracing::info!(
            "Session {} created by {} (ops: {:?}, private: {})",
            code,
            name,
            record.allowed_operations,
            is_private
        );
        let client = Self::new(store, config, record, name, Writer::Host(writer), rng);
        Ok((client, subscription))
    }

    /// Take the guest seat of a waiting session.
    ///
    /// The check and the patch are two separate store calls. Two guests
    /// joining at the same moment can both pass the check; the later patch
    /// wins and the earlier guest ends up in a session carrying the other
    /// guest's name.
    pub async fn join(
        store: Arc<dyn SessionStore>,
        config: DuelConfig,
        code: &str,
        guest_name: &str,
    ) -> DuelResult<(Self, RecordSubscription)> {
        let code = SessionCode::parse(code).map_err(DuelError::MalformedCode)?;
        let key = session_key(&code);

        let mut record = match store.read(&key).await? {
            Some(record) if record.host_connected => record,
            _ => return Err(DuelError::SessionNotFound(code)),
        };
        if record.status != SessionStatus::Waiting {
            return Err(DuelError::SessionNotJoinable {
                code,
                status: record.status,
            });
        }

        let name = display_name(guest_name);
        let writer = GuestWriter;
        let join = writer.join(&name);
        match store.patch(&key, join.clone()).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(DuelError::SessionNotFound(code)),
            Err(e) => return Err(e.into()),
        }
        join.apply(&mut record);
        store
            .register_cleanup_on_disconnect(&key, writer.presence_cleanup())
            .await?;
        let subscription = store.subscribe(&key).await?;

        tracing::info!("{} joined session {} hosted by {}", name, code, record.host_name);
        let rng = seeded_rng(&config);
        let client = Self::new(store, config, record, name, Writer::Guest(writer), rng);
        Ok((client, subscription))
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn role(&self) -> Role {
        self.writer.role()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> Option<&SessionRecord> {
        self.record.as_ref()
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.round.as_ref().map(|r| &r.question)
    }

    /// Whether answer entry is currently disabled
    pub fn input_locked(&self) -> bool {
        self.closed
            || self.winner.is_some()
            || self.round.as_ref().is_none_or(|r| r.answered)
    }

    /// (host score, guest score) as this client knows them
    pub fn scores(&self) -> (u32, u32) {
        match self.role() {
            Role::Host => (self.own_score, self.opponent_score),
            Role::Guest => (self.opponent_score, self.own_score),
        }
    }

    pub fn winner(&self) -> Option<Role> {
        self.winner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// When the host's round loop wants to issue the next question
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_question_at
    }

    fn ensure_open(&self) -> DuelResult<()> {
        if self.closed {
            Err(DuelError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// React to one delivered snapshot. Safe to call repeatedly with the same
    /// snapshot; only changes produce events or writes.
    ///
    /// A failed store write becomes a `DuelEvent::Failed` next to the events
    /// already produced; the write is retried when the next snapshot arrives.
    pub async fn observe(
        &mut self,
        snapshot: Option<SessionRecord>,
        now: Instant,
    ) -> Vec<DuelEvent> {
        if self.closed {
            return Vec::new();
        }
        let Some(record) = snapshot else {
            return self.handle_vanished().await;
        };
        if let Some(current) = &self.record {
            if record.version < current.version {
                tracing::debug!(
                    "Session {} ignoring stale snapshot v{} (have v{})",
                    self.code,
                    record.version,
                    current.version
                );
                return Vec::new();
            }
        }

        let mut events = Vec::new();
        self.record = Some(record.clone());

        if self.opponent_dropped(&record) {
            events.push(DuelEvent::OpponentDisconnected);
            self.handle_opponent_drop().await;
            return events;
        }

        if self.role() == Role::Host && !self.opponent_joined {
            if let Some(name) = &record.guest_name {
                self.opponent_joined = true;
                events.push(DuelEvent::OpponentJoined { name: name.clone() });
            }
        }

        if let Err(e) = self.start_if_ready(&record, now).await {
            self.report(e, &mut events);
        }
        self.track_question(&record, now, &mut events);
        let round_closed = self.track_opponent_answer(&record, &mut events);
        if let Err(e) = self.check_win().await {
            self.report(e, &mut events);
        }
        if round_closed {
            self.schedule_next_question(now);
        }
        self.track_game_over(&record, &mut events);
        if let Err(e) = self.track_rematch(&record, now, &mut events).await {
            self.report(e, &mut events);
        }

        events
    }

    fn report(&self, err: DuelError, events: &mut Vec<DuelEvent>) {
        tracing::warn!("Session {} update failed: {}", self.code, err);
        events.push(DuelEvent::Failed(err));
    }

    /// Host: on seeing the guest's `ready`, switch to playing and arm the first question
    async fn start_if_ready(&mut self, record: &SessionRecord, now: Instant) -> DuelResult<()> {
        let Writer::Host(host) = self.writer else {
            return Ok(());
        };
        if self.started || record.status != SessionStatus::Ready {
            return Ok(());
        }

        self.started = true;
        if let Err(e) = self.store.patch(&self.key, host.start_playing()).await {
            self.started = false;
            return Err(e.into());
        }
        self.own_score = 0;
        self.opponent_score = 0;
        self.next_question_at = Some(now + self.config.start_delay);
        tracing::info!("Session {} is now playing", self.code);
        Ok(())
    }

    /// Snapshot of everything a display layer needs
    pub fn view(&self) -> DuelView {
        let (host_score, guest_score) = self.scores();
        let record = self.record.as_ref();
        let opponent = self.role().opponent();
        DuelView {
            code: self.code.clone(),
            role: self.role(),
            status: record.map(|r| r.status),
            opponent_name: record.and_then(|r| match opponent {
                Role::Host => Some(r.host_name.clone()),
                Role::Guest => r.guest_name.clone(),
            }),
            question: self.current_question().cloned(),
            input_locked: self.input_locked(),
            host_score,
            guest_score,
            game_over: self.winner.is_some(),
            winner: self.winner,
            rematch_requested: self.rematch.requested,
            opponent_wants_rematch: record.is_some_and(|r| r.wants_rematch(opponent)),
            closed: self.closed,
        }
    }
}
