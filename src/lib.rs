// Public API for the duel client, the store backends and the relay server

pub mod config;
pub mod directory;
pub mod duel;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
pub mod ws;

pub use config::{DuelConfig, RelayConfig};
pub use directory::{list_open_sessions, open_sessions};
pub use duel::{AnswerOutcome, DuelClient, DuelEvent, DuelHandle, DuelView};
pub use error::{DuelError, DuelResult};
pub use store::{MemoryStore, RemoteStore, SessionStore};
