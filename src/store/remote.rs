use super::{
    CollectionSubscription, Patch, RecordSubscription, SessionStore, StoreError, StoreResult,
    Subscription,
};
use crate::protocol::{codes, ClientMessage, RequestId, ServerMessage};
use crate::types::SessionRecord;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

enum Outgoing {
    Message(ClientMessage),
    Close,
}

/// Where incoming server messages go
#[derive(Default)]
struct Routes {
    closed: bool,
    pending: HashMap<RequestId, oneshot::Sender<ServerMessage>>,
    records: HashMap<RequestId, mpsc::UnboundedSender<Option<SessionRecord>>>,
    collections: HashMap<RequestId, mpsc::UnboundedSender<Vec<SessionRecord>>>,
}

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `SessionStore` backed by a relay server over WebSocket
///
/// The socket is the store connection: closing it (or losing it) makes the
/// relay apply this client's disconnect cleanups.
pub struct RemoteStore {
    outbound: mpsc::UnboundedSender<Outgoing>,
    routes: Arc<Mutex<Routes>>,
    next_req: AtomicU64,
}

impl RemoteStore {
    /// Connect to a relay, e.g. `ws://127.0.0.1:6574/ws`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        tracing::info!("Connected to session relay at {}", url);

        let (outbound, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let io_routes = routes.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = outgoing.recv() => {
                        match next {
                            Some(Outgoing::Message(msg)) => {
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        tracing::error!("Failed to encode store request: {}", e);
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Outgoing::Close) | None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }

                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => route(&io_routes, text.as_str()),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("Relay connection error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            // Dropping every sender fails pending requests and ends subscriptions
            let mut routes = lock(&io_routes);
            routes.closed = true;
            routes.pending.clear();
            routes.records.clear();
            routes.collections.clear();
            tracing::info!("Relay connection closed");
        });

        Ok(Self {
            outbound,
            routes,
            next_req: AtomicU64::new(1),
        })
    }

    /// Close the socket; the relay treats this as a dropped connection
    pub fn close(&self) {
        let _ = self.outbound.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.routes).closed || self.outbound.is_closed()
    }

    fn next_req(&self) -> RequestId {
        self.next_req.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, req: RequestId, msg: ClientMessage) -> StoreResult<ServerMessage> {
        if self.is_closed() {
            return Err(StoreError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = lock(&self.routes);
            if routes.closed {
                return Err(StoreError::Disconnected);
            }
            routes.pending.insert(req, tx);
        }

        if self.outbound.send(Outgoing::Message(msg)).is_err() {
            lock(&self.routes).pending.remove(&req);
            return Err(StoreError::Disconnected);
        }

        match rx.await.map_err(|_| StoreError::Disconnected)? {
            ServerMessage::Error { code, msg, .. } => Err(match code.as_str() {
                codes::NOT_FOUND => StoreError::NotFound(msg),
                codes::UNAVAILABLE => StoreError::Unavailable(msg),
                _ => StoreError::Protocol(msg),
            }),
            reply => Ok(reply),
        }
    }

    async fn ack(&self, req: RequestId, msg: ClientMessage) -> StoreResult<()> {
        match self.call(req, msg).await? {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(StoreError::Protocol(format!(
                "expected ack, got {:?}",
                other
            ))),
        }
    }

    fn unsubscriber(&self, sub: RequestId) -> impl FnOnce() + Send + 'static {
        let routes = self.routes.clone();
        let outbound = self.outbound.clone();
        move || {
            let mut routes = lock(&routes);
            routes.records.remove(&sub);
            routes.collections.remove(&sub);
            if !routes.closed {
                let _ = outbound.send(Outgoing::Message(ClientMessage::Unsubscribe { sub }));
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn route(routes: &Mutex<Routes>, text: &str) {
    let msg = match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Ignoring malformed relay message: {}", e);
            return;
        }
    };

    let mut routes = lock(routes);
    match msg {
        ServerMessage::Snapshot { sub, record } => {
            if let Some(tx) = routes.records.get(&sub) {
                let _ = tx.send(record);
            }
        }
        ServerMessage::Collection { sub, records } => {
            if let Some(tx) = routes.collections.get(&sub) {
                let _ = tx.send(records);
            }
        }
        reply => {
            if let Some(tx) = reply.reply_to().and_then(|req| routes.pending.remove(&req)) {
                let _ = tx.send(reply);
            }
        }
    }
}

#[async_trait]
impl SessionStore for RemoteStore {
    async fn write(&self, key: &str, record: SessionRecord) -> StoreResult<()> {
        let req = self.next_req();
        let msg = ClientMessage::Write {
            req,
            key: key.to_string(),
            record,
        };
        self.ack(req, msg).await
    }

    async fn patch(&self, key: &str, patch: Patch) -> StoreResult<()> {
        let req = self.next_req();
        let msg = ClientMessage::Patch {
            req,
            key: key.to_string(),
            patch,
        };
        self.ack(req, msg).await
    }

    async fn read(&self, key: &str) -> StoreResult<Option<SessionRecord>> {
        let req = self.next_req();
        let msg = ClientMessage::Read {
            req,
            key: key.to_string(),
        };
        match self.call(req, msg).await? {
            ServerMessage::Record { record, .. } => Ok(record),
            other => Err(StoreError::Protocol(format!(
                "expected record, got {:?}",
                other
            ))),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let req = self.next_req();
        let msg = ClientMessage::Delete {
            req,
            key: key.to_string(),
        };
        self.ack(req, msg).await
    }

    async fn subscribe(&self, key: &str) -> StoreResult<RecordSubscription> {
        let req = self.next_req();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = lock(&self.routes);
            if routes.closed {
                return Err(StoreError::Disconnected);
            }
            // Registered before sending so the first snapshot cannot be missed
            routes.records.insert(req, tx);
        }

        let msg = ClientMessage::Subscribe {
            req,
            key: key.to_string(),
        };
        if let Err(e) = self.ack(req, msg).await {
            lock(&self.routes).records.remove(&req);
            return Err(e);
        }
        Ok(Subscription::new(rx, self.unsubscriber(req)))
    }

    async fn subscribe_collection(&self, prefix: &str) -> StoreResult<CollectionSubscription> {
        let req = self.next_req();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = lock(&self.routes);
            if routes.closed {
                return Err(StoreError::Disconnected);
            }
            routes.collections.insert(req, tx);
        }

        let msg = ClientMessage::SubscribeCollection {
            req,
            prefix: prefix.to_string(),
        };
        if let Err(e) = self.ack(req, msg).await {
            lock(&self.routes).collections.remove(&req);
            return Err(e);
        }
        Ok(Subscription::new(rx, self.unsubscriber(req)))
    }

    async fn register_cleanup_on_disconnect(&self, key: &str, patch: Patch) -> StoreResult<()> {
        let req = self.next_req();
        let msg = ClientMessage::RegisterCleanup {
            req,
            key: key.to_string(),
            patch,
        };
        self.ack(req, msg).await
    }

    async fn cancel_cleanup_on_disconnect(&self, key: &str) -> StoreResult<()> {
        let req = self.next_req();
        let msg = ClientMessage::CancelCleanup {
            req,
            key: key.to_string(),
        };
        self.ack(req, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, SessionCode};

    #[test]
    fn test_route_dispatches_replies_and_snapshots() {
        let routes = Mutex::new(Routes::default());
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let (snap_tx, mut snap_rx) = mpsc::unbounded_channel();
        {
            let mut guard = lock(&routes);
            guard.pending.insert(1, reply_tx);
            guard.records.insert(2, snap_tx);
        }

        let record = SessionRecord::new(
            SessionCode::from_index(42),
            "Alice".to_string(),
            vec![Operation::Add],
            false,
        );
        let snapshot = serde_json::to_string(&ServerMessage::Snapshot {
            sub: 2,
            record: Some(record.clone()),
        })
        .unwrap();
        route(&routes, &snapshot);
        route(&routes, r#"{"t":"ack","req":1}"#);
        route(&routes, "not json");

        assert!(matches!(reply_rx.try_recv(), Ok(ServerMessage::Ack { req: 1 })));
        assert_eq!(snap_rx.try_recv().unwrap(), Some(record));
        assert!(lock(&routes).pending.is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_nothing_is_unavailable() {
        let result = RemoteStore::connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
