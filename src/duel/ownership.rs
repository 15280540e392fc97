//! Role-scoped writers
//!
//! Every field of the session record has one owning role, and a client can
//! only build patches through the writer of its own role. Last-write-wins is
//! safe because of this: two roles never race on the same field. The
//! exceptions are the idempotent game-over write (both sides compute the same
//! value) and the host's resets at question issue and rematch restart.

use crate::store::{FieldUpdate, Patch};
use crate::types::{AnswerRecord, Question, Role, SessionStatus};

/// Writes shared by both roles; safe to race because both sides write identical values
fn finish(winner: Role) -> Patch {
    Patch::new(vec![
        FieldUpdate::GameOver(true),
        FieldUpdate::Winner(Some(winner)),
        FieldUpdate::Status(SessionStatus::Ended),
    ])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostWriter;

impl HostWriter {
    /// Applied by the store if the host's connection drops
    pub fn presence_cleanup(&self) -> Patch {
        Patch::new(vec![FieldUpdate::HostConnected(false)])
    }

    /// Ready -> playing with a clean scoreboard
    pub fn start_playing(&self) -> Patch {
        Patch::new(vec![
            FieldUpdate::Status(SessionStatus::Playing),
            FieldUpdate::HostScore(0),
            FieldUpdate::GuestScore(0),
            FieldUpdate::HostAnswer(None),
            FieldUpdate::GuestAnswer(None),
            FieldUpdate::GameOver(false),
            FieldUpdate::Winner(None),
        ])
    }

    /// New round: publish the question and clear both answers
    pub fn issue_question(&self, question: Question) -> Patch {
        Patch::new(vec![
            FieldUpdate::CurrentQuestion(Some(question)),
            FieldUpdate::HostAnswer(None),
            FieldUpdate::GuestAnswer(None),
        ])
    }

    pub fn record_answer(&self, score: u32, answer: AnswerRecord) -> Patch {
        Patch::new(vec![
            FieldUpdate::HostScore(score),
            FieldUpdate::HostAnswer(Some(answer)),
        ])
    }

    pub fn request_rematch(&self) -> Patch {
        Patch::new(vec![FieldUpdate::RematchHost(true)])
    }

    /// Ended -> playing once both players asked for a rematch
    pub fn restart(&self) -> Patch {
        Patch::new(vec![
            FieldUpdate::HostScore(0),
            FieldUpdate::GuestScore(0),
            FieldUpdate::HostAnswer(None),
            FieldUpdate::GuestAnswer(None),
            FieldUpdate::GameOver(false),
            FieldUpdate::Winner(None),
            FieldUpdate::CurrentQuestion(None),
            FieldUpdate::RematchHost(false),
            FieldUpdate::RematchGuest(false),
            FieldUpdate::Status(SessionStatus::Playing),
        ])
    }

    pub fn finish(&self, winner: Role) -> Patch {
        finish(winner)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GuestWriter;

impl GuestWriter {
    pub fn join(&self, guest_name: &str) -> Patch {
        Patch::new(vec![
            FieldUpdate::GuestName(Some(guest_name.to_string())),
            FieldUpdate::GuestConnected(true),
            FieldUpdate::Status(SessionStatus::Ready),
        ])
    }

    pub fn presence_cleanup(&self) -> Patch {
        Patch::new(vec![FieldUpdate::GuestConnected(false)])
    }

    /// Explicit leave; the host notices through its subscription
    pub fn leave(&self) -> Patch {
        Patch::new(vec![FieldUpdate::GuestConnected(false)])
    }

    pub fn record_answer(&self, score: u32, answer: AnswerRecord) -> Patch {
        Patch::new(vec![
            FieldUpdate::GuestScore(score),
            FieldUpdate::GuestAnswer(Some(answer)),
        ])
    }

    pub fn request_rematch(&self) -> Patch {
        Patch::new(vec![FieldUpdate::RematchGuest(true)])
    }

    pub fn finish(&self, winner: Role) -> Patch {
        finish(winner)
    }
}

/// The writer a client holds, fixed by its role for the session's lifetime
#[derive(Debug, Clone, Copy)]
pub enum Writer {
    Host(HostWriter),
    Guest(GuestWriter),
}

impl Writer {
    pub fn role(&self) -> Role {
        match self {
            Writer::Host(_) => Role::Host,
            Writer::Guest(_) => Role::Guest,
        }
    }

    pub fn presence_cleanup(&self) -> Patch {
        match self {
            Writer::Host(w) => w.presence_cleanup(),
            Writer::Guest(w) => w.presence_cleanup(),
        }
    }

    pub fn record_answer(&self, score: u32, answer: AnswerRecord) -> Patch {
        match self {
            Writer::Host(w) => w.record_answer(score, answer),
            Writer::Guest(w) => w.record_answer(score, answer),
        }
    }

    pub fn request_rematch(&self) -> Patch {
        match self {
            Writer::Host(w) => w.request_rematch(),
            Writer::Guest(w) => w.request_rematch(),
        }
    }

    pub fn finish(&self, winner: Role) -> Patch {
        match self {
            Writer::Host(w) => w.finish(winner),
            Writer::Guest(w) => w.finish(winner),
        }
    }
}
