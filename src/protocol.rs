//! Wire protocol between `RemoteStore` clients and the relay server
//!
//! Every request carries a client-chosen `req` id that the reply echoes.
//! Subscriptions reuse their request id as the subscription id, so a client
//! can route snapshots before the acknowledgement arrives.

use crate::store::Patch;
use crate::types::SessionRecord;
use serde::{Deserialize, Serialize};

pub type RequestId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Write {
        req: RequestId,
        key: String,
        record: SessionRecord,
    },
    Patch {
        req: RequestId,
        key: String,
        patch: Patch,
    },
    Read {
        req: RequestId,
        key: String,
    },
    Delete {
        req: RequestId,
        key: String,
    },
    Subscribe {
        req: RequestId,
        key: String,
    },
    SubscribeCollection {
        req: RequestId,
        prefix: String,
    },
    Unsubscribe {
        sub: RequestId,
    },
    RegisterCleanup {
        req: RequestId,
        key: String,
        patch: Patch,
    },
    CancelCleanup {
        req: RequestId,
        key: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        req: RequestId,
    },
    Record {
        req: RequestId,
        record: Option<SessionRecord>,
    },
    Error {
        req: RequestId,
        code: String,
        msg: String,
    },
    Snapshot {
        sub: RequestId,
        record: Option<SessionRecord>,
    },
    Collection {
        sub: RequestId,
        records: Vec<SessionRecord>,
    },
}

impl ServerMessage {
    /// Request id this message answers, if it is a reply
    pub fn reply_to(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Ack { req }
            | ServerMessage::Record { req, .. }
            | ServerMessage::Error { req, .. } => Some(*req),
            ServerMessage::Snapshot { .. } | ServerMessage::Collection { .. } => None,
        }
    }
}

/// Error codes carried in `ServerMessage::Error`
pub mod codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
}
