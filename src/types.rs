use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic id of a round, written by the host with each new question
pub type IssuedAt = u64;

/// Key prefix shared by every session record in the store
pub const SESSIONS_PREFIX: &str = "sessions/";

/// Number of distinct session codes ("00" through "99")
pub const CODE_SPACE: u8 = 100;

/// Store key for a session code
pub fn session_key(code: &SessionCode) -> String {
    format!("{}{}", SESSIONS_PREFIX, code)
}

/// A two-digit decimal session code, the only identifier shared between players
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Validate user input (surrounding whitespace is tolerated)
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "session code must be exactly 2 digits, got {:?}",
                raw
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Code for a slot in the code space; values wrap at 100
    pub fn from_index(index: u8) -> Self {
        Self(format!("{:02}", index % CODE_SPACE))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Add,
        Operation::Subtract,
        Operation::Multiply,
        Operation::Divide,
    ];

    pub fn symbol(&self) -> char {
        match self {
            Operation::Add => '+',
            Operation::Subtract => '-',
            Operation::Multiply => '×',
            Operation::Divide => '÷',
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Ready,
    Playing,
    Ended,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn opponent(&self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

/// One arithmetic question; `a op b` always has a non-negative integer result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub a: u32,
    pub b: u32,
    pub op: Operation,
    pub issued_at: IssuedAt,
}

impl Question {
    /// The exact integer answer
    pub fn answer(&self) -> u32 {
        match self.op {
            Operation::Add => self.a + self.b,
            Operation::Subtract => self.a.saturating_sub(self.b),
            Operation::Multiply => self.a * self.b,
            Operation::Divide => {
                if self.b == 0 {
                    0
                } else {
                    self.a / self.b
                }
            }
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.a, self.op.symbol(), self.b)
    }
}

/// A player's accepted answer for one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub correct: bool,
    pub latency_ms: u64,
    /// Monotonic id of the answer; equals the `issued_at` of the round answered
    pub answered_at: u64,
}

/// The single shared document representing one duel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub code: SessionCode,
    pub host_name: String,
    pub guest_name: Option<String>,
    pub host_connected: bool,
    pub guest_connected: bool,
    pub allowed_operations: Vec<Operation>,
    pub status: SessionStatus,
    pub is_private: bool,
    pub current_question: Option<Question>,
    pub host_score: u32,
    pub guest_score: u32,
    pub host_answer: Option<AnswerRecord>,
    pub guest_answer: Option<AnswerRecord>,
    pub game_over: bool,
    pub winner: Option<Role>,
    pub rematch_host: bool,
    pub rematch_guest: bool,
    pub created_at: DateTime<Utc>,
    /// Bumped by the store on every write and patch
    #[serde(default)]
    pub version: u64,
}

impl SessionRecord {
    /// Initial record as written by the host at creation
    pub fn new(
        code: SessionCode,
        host_name: String,
        allowed_operations: Vec<Operation>,
        is_private: bool,
    ) -> Self {
        Self {
            code,
            host_name,
            guest_name: None,
            host_connected: true,
            guest_connected: false,
            allowed_operations,
            status: SessionStatus::Waiting,
            is_private,
            current_question: None,
            host_score: 0,
            guest_score: 0,
            host_answer: None,
            guest_answer: None,
            game_over: false,
            winner: None,
            rematch_host: false,
            rematch_guest: false,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn score(&self, role: Role) -> u32 {
        match role {
            Role::Host => self.host_score,
            Role::Guest => self.guest_score,
        }
    }

    pub fn answer(&self, role: Role) -> Option<&AnswerRecord> {
        match role {
            Role::Host => self.host_answer.as_ref(),
            Role::Guest => self.guest_answer.as_ref(),
        }
    }

    pub fn connected(&self, role: Role) -> bool {
        match role {
            Role::Host => self.host_connected,
            Role::Guest => self.guest_connected,
        }
    }

    pub fn wants_rematch(&self, role: Role) -> bool {
        match role {
            Role::Host => self.rematch_host,
            Role::Guest => self.rematch_guest,
        }
    }

    /// Whether the directory should list this session
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Waiting && self.host_connected && !self.is_private
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_code_validation() {
        assert_eq!(SessionCode::parse("42").unwrap().as_str(), "42");
        assert_eq!(SessionCode::parse(" 07 ").unwrap().as_str(), "07");
        assert!(SessionCode::parse("7").is_err());
        assert!(SessionCode::parse("123").is_err());
        assert!(SessionCode::parse("4a").is_err());
        assert!(SessionCode::parse("").is_err());
    }

    #[test]
    fn test_session_code_from_index_pads() {
        assert_eq!(SessionCode::from_index(3).as_str(), "03");
        assert_eq!(SessionCode::from_index(99).as_str(), "99");
        assert_eq!(SessionCode::from_index(100).as_str(), "00");
    }

    #[test]
    fn test_question_answers() {
        let q = |a, b, op| Question {
            a,
            b,
            op,
            issued_at: 1,
        };
        assert_eq!(q(6, 7, Operation::Multiply).answer(), 42);
        assert_eq!(q(40, 12, Operation::Subtract).answer(), 28);
        assert_eq!(q(56, 8, Operation::Divide).answer(), 7);
        assert_eq!(q(33, 67, Operation::Add).answer(), 100);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = SessionRecord::new(
            SessionCode::parse("42").unwrap(),
            "Alice".to_string(),
            vec![Operation::Multiply],
            false,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["code"], "42");
        assert_eq!(json["hostConnected"], true);
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["allowedOperations"][0], "multiply");
        assert!(json["guestName"].is_null());

        let back: SessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_rejects_bad_code() {
        let mut json = serde_json::to_value(SessionRecord::new(
            SessionCode::from_index(1),
            "Alice".to_string(),
            vec![Operation::Add],
            false,
        ))
        .unwrap();
        json["code"] = serde_json::Value::String("abc".to_string());
        assert!(serde_json::from_value::<SessionRecord>(json).is_err());
    }

    #[test]
    fn test_is_open() {
        let mut record = SessionRecord::new(
            SessionCode::from_index(1),
            "Alice".to_string(),
            vec![Operation::Add],
            false,
        );
        assert!(record.is_open());
        record.is_private = true;
        assert!(!record.is_open());
        record.is_private = false;
        record.host_connected = false;
        assert!(!record.is_open());
        record.host_connected = true;
        record.status = SessionStatus::Ready;
        assert!(!record.is_open());
    }
}
