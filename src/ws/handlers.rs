//! Relay message dispatch
//!
//! Maps each `ClientMessage` onto the socket's `MemoryConnection` and builds
//! the reply. Subscriptions get a forwarding task that pushes snapshots into
//! the socket's outbound channel.

use crate::protocol::{codes, ClientMessage, RequestId, ServerMessage};
use crate::store::{MemoryConnection, SessionStore, StoreError, Subscription};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Forwarding tasks of one socket, by subscription id
pub type Subscriptions = HashMap<RequestId, AbortHandle>;

fn error_reply(req: RequestId, err: StoreError) -> ServerMessage {
    let code = match err {
        StoreError::NotFound(_) => codes::NOT_FOUND,
        StoreError::Unavailable(_) | StoreError::Disconnected => codes::UNAVAILABLE,
        StoreError::Protocol(_) => codes::PARSE_ERROR,
    };
    ServerMessage::Error {
        req,
        code: code.to_string(),
        msg: err.to_string(),
    }
}

fn ack_or_error(req: RequestId, result: Result<(), StoreError>) -> ServerMessage {
    match result {
        Ok(()) => ServerMessage::Ack { req },
        Err(e) => error_reply(req, e),
    }
}

/// Push every item of `subscription` to the socket until either side ends
fn forward<T, F>(
    mut subscription: Subscription<T>,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
    wrap: F,
) -> AbortHandle
where
    T: Send + 'static,
    F: Fn(T) -> ServerMessage + Send + 'static,
{
    let outbound = outbound.clone();
    tokio::spawn(async move {
        while let Some(item) = subscription.recv().await {
            if outbound.send(wrap(item)).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

/// Handle client messages and return optional response
pub async fn handle_message(
    msg: ClientMessage,
    connection: &MemoryConnection,
    subscriptions: &mut Subscriptions,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<ServerMessage> {
    let reply = match msg {
        ClientMessage::Write { req, key, record } => {
            ack_or_error(req, connection.write(&key, record).await)
        }

        ClientMessage::Patch { req, key, patch } => {
            ack_or_error(req, connection.patch(&key, patch).await)
        }

        ClientMessage::Read { req, key } => match connection.read(&key).await {
            Ok(record) => ServerMessage::Record { req, record },
            Err(e) => error_reply(req, e),
        },

        ClientMessage::Delete { req, key } => ack_or_error(req, connection.delete(&key).await),

        ClientMessage::Subscribe { req, key } => match connection.subscribe(&key).await {
            Ok(subscription) => {
                tracing::debug!("Connection {} subscribed to {}", connection.id(), key);
                let feed = forward(subscription, outbound, move |record| {
                    ServerMessage::Snapshot { sub: req, record }
                });
                if let Some(previous) = subscriptions.insert(req, feed) {
                    previous.abort();
                }
                ServerMessage::Ack { req }
            }
            Err(e) => error_reply(req, e),
        },

        ClientMessage::SubscribeCollection { req, prefix } => {
            match connection.subscribe_collection(&prefix).await {
                Ok(subscription) => {
                    let feed = forward(subscription, outbound, move |records| {
                        ServerMessage::Collection { sub: req, records }
                    });
                    if let Some(previous) = subscriptions.insert(req, feed) {
                        previous.abort();
                    }
                    ServerMessage::Ack { req }
                }
                Err(e) => error_reply(req, e),
            }
        }

        ClientMessage::Unsubscribe { sub } => {
            if let Some(feed) = subscriptions.remove(&sub) {
                feed.abort();
            }
            return None;
        }

        ClientMessage::RegisterCleanup { req, key, patch } => ack_or_error(
            req,
            connection.register_cleanup_on_disconnect(&key, patch).await,
        ),

        ClientMessage::CancelCleanup { req, key } => {
            ack_or_error(req, connection.cancel_cleanup_on_disconnect(&key).await)
        }
    };
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duel::HostWriter;
    use crate::store::MemoryStore;
    use crate::types::{session_key, Operation, SessionCode, SessionRecord};

    fn record() -> SessionRecord {
        SessionRecord::new(
            SessionCode::from_index(12),
            "Alice".to_string(),
            vec![Operation::Add],
            false,
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        let connection = store.connect();
        let (outbound, _pushes) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new();
        let key = session_key(&SessionCode::from_index(12));

        let reply = handle_message(
            ClientMessage::Write {
                req: 1,
                key: key.clone(),
                record: record(),
            },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::Ack { req: 1 })));

        let reply = handle_message(
            ClientMessage::Read { req: 2, key },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;
        match reply {
            Some(ServerMessage::Record { req, record: got }) => {
                assert_eq!(req, 2);
                let got = got.unwrap();
                assert_eq!(got.host_name, "Alice");
                assert_eq!(got.version, 1);
            }
            other => panic!("Expected Record message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_patch_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let connection = store.connect();
        let (outbound, _pushes) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new();

        let reply = handle_message(
            ClientMessage::Patch {
                req: 7,
                key: "sessions/99".to_string(),
                patch: HostWriter.presence_cleanup(),
            },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;

        if let Some(ServerMessage::Error { req, code, .. }) = reply {
            assert_eq!(req, 7);
            assert_eq!(code, codes::NOT_FOUND);
        } else {
            panic!("Expected Error message");
        }
    }

    #[tokio::test]
    async fn test_outage_is_unavailable() {
        let store = MemoryStore::new();
        let connection = store.connect();
        let (outbound, _pushes) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new();
        store.set_available(false);

        let reply = handle_message(
            ClientMessage::Read {
                req: 3,
                key: "sessions/01".to_string(),
            },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;
        assert!(matches!(
            reply,
            Some(ServerMessage::Error { ref code, .. }) if code == codes::UNAVAILABLE
        ));
    }

    #[tokio::test]
    async fn test_subscription_pushes_snapshots_until_unsubscribed() {
        let store = MemoryStore::new();
        let connection = store.connect();
        let (outbound, mut pushes) = mpsc::unbounded_channel();
        let mut subs = Subscriptions::new();
        let key = session_key(&SessionCode::from_index(12));

        let reply = handle_message(
            ClientMessage::Subscribe {
                req: 5,
                key: key.clone(),
            },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::Ack { req: 5 })));
        assert!(matches!(
            pushes.recv().await,
            Some(ServerMessage::Snapshot { sub: 5, record: None })
        ));

        store.connect().write(&key, record()).await.unwrap();
        assert!(matches!(
            pushes.recv().await,
            Some(ServerMessage::Snapshot { sub: 5, record: Some(_) })
        ));

        let reply = handle_message(
            ClientMessage::Unsubscribe { sub: 5 },
            &connection,
            &mut subs,
            &outbound,
        )
        .await;
        assert!(reply.is_none());
        assert!(subs.is_empty());
    }
}
