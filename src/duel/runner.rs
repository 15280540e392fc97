//! Background task that owns a `DuelClient`
//!
//! The task serialises three inputs: record snapshots, commands from
//! `DuelHandle`s and the host's next-question timer. After each one it
//! publishes a fresh `DuelView` on a watch channel.

use super::{AnswerOutcome, DuelClient, DuelEvent};
use crate::config::DuelConfig;
use crate::error::{DuelError, DuelResult};
use crate::store::{RecordSubscription, SessionStore};
use crate::types::{Operation, Question, Role, SessionCode, SessionStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// What a display layer renders
#[derive(Debug, Clone, PartialEq)]
pub struct DuelView {
    pub code: SessionCode,
    pub role: Role,
    /// `None` once the record is gone
    pub status: Option<SessionStatus>,
    pub opponent_name: Option<String>,
    pub question: Option<Question>,
    pub input_locked: bool,
    pub host_score: u32,
    pub guest_score: u32,
    pub game_over: bool,
    pub winner: Option<Role>,
    pub rematch_requested: bool,
    pub opponent_wants_rematch: bool,
    pub closed: bool,
}

enum Command {
    SubmitAnswer {
        raw: String,
        reply: oneshot::Sender<DuelResult<AnswerOutcome>>,
    },
    RequestRematch {
        reply: oneshot::Sender<DuelResult<()>>,
    },
    NextQuestion {
        reply: oneshot::Sender<DuelResult<Question>>,
    },
    Leave {
        reply: oneshot::Sender<DuelResult<()>>,
    },
}

/// Cloneable handle to a running duel. When the last handle is dropped the
/// task leaves the session.
#[derive(Clone)]
pub struct DuelHandle {
    code: SessionCode,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<DuelView>,
}

/// Run `client` in a background task
pub fn spawn(
    client: DuelClient,
    subscription: RecordSubscription,
) -> (DuelHandle, mpsc::UnboundedReceiver<DuelEvent>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(client.view());

    let handle = DuelHandle {
        code: client.code().clone(),
        role: client.role(),
        commands: commands_tx,
        view: view_rx,
    };
    tokio::spawn(run(client, subscription, commands_rx, events_tx, view_tx));
    (handle, events_rx)
}

async fn run(
    mut client: DuelClient,
    mut subscription: RecordSubscription,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<DuelEvent>,
    view: watch::Sender<DuelView>,
) {
    loop {
        let deadline = client.next_deadline();
        let mut new_events = Vec::new();

        tokio::select! {
            snapshot = subscription.recv() => {
                match snapshot {
                    Some(snapshot) => new_events = client.observe(snapshot, Instant::now()).await,
                    None => {
                        client.mark_closed();
                        new_events.push(DuelEvent::SessionClosed);
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut client, command, &view).await,
                    None => {
                        tracing::debug!("All handles for session {} dropped", client.code());
                        if let Err(e) = client.leave().await {
                            tracing::warn!("Leaving session {} failed: {}", client.code(), e);
                        }
                    }
                }
            }

            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Err(e) = client.fire_due(Instant::now()).await {
                    tracing::warn!("Session {} could not issue a question: {}", client.code(), e);
                    new_events.push(DuelEvent::Failed(e));
                }
            }
        }

        // View first, so a listener reacting to an event reads matching state
        view.send_replace(client.view());
        for event in new_events {
            let _ = events.send(event);
        }
        if client.is_closed() {
            break;
        }
    }

    tracing::debug!("Duel task for session {} finished", client.code());
}

async fn handle_command(
    client: &mut DuelClient,
    command: Command,
    view: &watch::Sender<DuelView>,
) {
    match command {
        Command::SubmitAnswer { raw, reply } => {
            let result = client.submit_answer(&raw, Instant::now()).await;
            view.send_replace(client.view());
            let _ = reply.send(result);
        }
        Command::RequestRematch { reply } => {
            let result = client.request_rematch().await;
            view.send_replace(client.view());
            let _ = reply.send(result);
        }
        Command::NextQuestion { reply } => {
            let result = client.generate_question().await;
            view.send_replace(client.view());
            let _ = reply.send(result);
        }
        Command::Leave { reply } => {
            let result = client.leave().await;
            view.send_replace(client.view());
            let _ = reply.send(result);
        }
    }
}

impl DuelHandle {
    /// Create a session and start driving it
    pub async fn create(
        store: Arc<dyn SessionStore>,
        config: DuelConfig,
        host_name: &str,
        operations: &[Operation],
        is_private: bool,
    ) -> DuelResult<(Self, mpsc::UnboundedReceiver<DuelEvent>)> {
        let (client, subscription) =
            DuelClient::create(store, config, host_name, operations, is_private).await?;
        Ok(spawn(client, subscription))
    }

    /// Join a session by code and start driving it
    pub async fn join(
        store: Arc<dyn SessionStore>,
        config: DuelConfig,
        code: &str,
        guest_name: &str,
    ) -> DuelResult<(Self, mpsc::UnboundedReceiver<DuelEvent>)> {
        let (client, subscription) = DuelClient::join(store, config, code, guest_name).await?;
        Ok(spawn(client, subscription))
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest published view
    pub fn view(&self) -> DuelView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change
    pub fn watch(&self) -> watch::Receiver<DuelView> {
        self.view.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<DuelResult<T>>) -> Command,
    ) -> DuelResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| DuelError::SessionClosed)?;
        response.await.map_err(|_| DuelError::SessionClosed)?
    }

    pub async fn submit_answer(&self, raw: &str) -> DuelResult<AnswerOutcome> {
        let raw = raw.to_string();
        self.request(|reply| Command::SubmitAnswer { raw, reply })
            .await
    }

    pub async fn request_rematch(&self) -> DuelResult<()> {
        self.request(|reply| Command::RequestRematch { reply }).await
    }

    /// Host only: issue a question right away instead of waiting for the timer
    pub async fn next_question(&self) -> DuelResult<Question> {
        self.request(|reply| Command::NextQuestion { reply }).await
    }

    pub async fn leave(&self) -> DuelResult<()> {
        self.request(|reply| Command::Leave { reply }).await
    }
}
