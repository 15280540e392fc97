use super::{
    CollectionSubscription, Patch, RecordSubscription, SessionStore, StoreError, StoreResult,
    Subscription,
};
use crate::types::SessionRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::AbortHandle;

/// Opaque id of one client connection
pub type ConnectionId = String;

/// Capacity of the change feed; slower subscribers get a fresh snapshot instead
const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Change {
    key: String,
    record: Option<SessionRecord>,
}

struct Inner {
    records: RwLock<HashMap<String, SessionRecord>>,
    changes: broadcast::Sender<Change>,
    /// Per connection, per key: the patch to apply if that connection drops
    cleanups: Mutex<HashMap<ConnectionId, HashMap<String, Patch>>>,
    available: AtomicBool,
}

/// In-process session store with change feeds and disconnect cleanup
///
/// Clones share the same data. Clients never use the store directly; each one
/// gets its own `MemoryConnection`.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(HashMap::new()),
                changes: tx,
                cleanups: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Open a new client connection
    pub fn connect(&self) -> MemoryConnection {
        let id = ulid::Ulid::new().to_string();
        tracing::debug!("Store connection opened: {}", id);
        MemoryConnection {
            store: self.clone(),
            id,
            alive: Arc::new(AtomicBool::new(true)),
            tasks: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Simulate an outage: while unavailable every operation fails
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Read a record without going through a connection
    pub async fn get(&self, key: &str) -> Option<SessionRecord> {
        self.inner.records.read().await.get(key).cloned()
    }

    /// All records under a prefix
    pub async fn list(&self, prefix: &str) -> Vec<SessionRecord> {
        self.inner
            .records
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }

    async fn write(&self, key: &str, mut record: SessionRecord) {
        let mut records = self.inner.records.write().await;
        record.version = records.get(key).map_or(1, |existing| existing.version + 1);
        records.insert(key.to_string(), record.clone());
        // Sent under the lock so subscribers see writes in commit order
        let _ = self.inner.changes.send(Change {
            key: key.to_string(),
            record: Some(record),
        });
    }

    async fn patch(&self, key: &str, patch: &Patch) -> StoreResult<()> {
        let mut records = self.inner.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        patch.apply(record);
        record.version += 1;
        let _ = self.inner.changes.send(Change {
            key: key.to_string(),
            record: Some(record.clone()),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) {
        let mut records = self.inner.records.write().await;
        if records.remove(key).is_some() {
            let _ = self.inner.changes.send(Change {
                key: key.to_string(),
                record: None,
            });
        }
    }

    async fn register_cleanup(&self, connection: &str, key: &str, patch: Patch) {
        let mut cleanups = self.inner.cleanups.lock().await;
        cleanups
            .entry(connection.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .merge(patch);
    }

    async fn cancel_cleanup(&self, connection: &str, key: &str) {
        let mut cleanups = self.inner.cleanups.lock().await;
        if let Some(keys) = cleanups.get_mut(connection) {
            keys.remove(key);
        }
    }

    /// Apply every cleanup patch a dropped connection left behind
    async fn fire_cleanups(&self, connection: &str) {
        let pending = self.inner.cleanups.lock().await.remove(connection);
        let Some(pending) = pending else {
            return;
        };

        for (key, patch) in pending {
            match self.patch(&key, &patch).await {
                Ok(()) => tracing::info!("Applied disconnect cleanup for {} on {}", connection, key),
                // The record was deleted before the connection dropped
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!("Skipped disconnect cleanup on missing record {}", key)
                }
                Err(e) => tracing::warn!("Disconnect cleanup on {} failed: {}", key, e),
            }
        }
    }

    async fn spawn_record_feed(&self, key: String) -> (RecordSubscription, AbortHandle) {
        // Subscribe before reading so no change slips between snapshot and feed
        let mut changes = self.inner.changes.subscribe();
        let initial = self.get(&key).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);

        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.key == key && tx.send(change.record).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Subscription on {} lagged by {} changes, resending snapshot",
                            key,
                            skipped
                        );
                        if tx.send(store.get(&key).await).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let abort = task.abort_handle();
        (Subscription::new(rx, move || task.abort()), abort)
    }

    async fn spawn_collection_feed(&self, prefix: String) -> (CollectionSubscription, AbortHandle) {
        let mut changes = self.inner.changes.subscribe();
        let initial = self.list(&prefix).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);

        let store = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let relevant = match changes.recv().await {
                    Ok(change) => change.key.starts_with(&prefix),
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if relevant && tx.send(store.list(&prefix).await).is_err() {
                    break;
                }
            }
        });

        let abort = task.abort_handle();
        (Subscription::new(rx, move || task.abort()), abort)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's connection to a `MemoryStore`
#[derive(Clone)]
pub struct MemoryConnection {
    store: MemoryStore,
    id: ConnectionId,
    alive: Arc<AtomicBool>,
    tasks: Arc<std::sync::Mutex<Vec<AbortHandle>>>,
}

impl MemoryConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Transport loss: ends this connection's subscriptions and lets the store
    /// apply the cleanup patches registered through it. Idempotent.
    pub async fn drop_connection(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Store connection dropped: {}", self.id);

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }

        self.store.fire_cleanups(&self.id).await;
    }

    fn check(&self) -> StoreResult<()> {
        if !self.is_alive() {
            return Err(StoreError::Disconnected);
        }
        self.store.check_available()
    }

    /// Keep a feed task for teardown; finished ones are dropped on the way
    fn track(&self, task: AbortHandle) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    #[cfg(test)]
    fn tracked_tasks(&self) -> usize {
        match self.tasks.lock() {
            Ok(tasks) => tasks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryConnection {
    async fn write(&self, key: &str, record: SessionRecord) -> StoreResult<()> {
        self.check()?;
        self.store.write(key, record).await;
        Ok(())
    }

    async fn patch(&self, key: &str, patch: Patch) -> StoreResult<()> {
        self.check()?;
        self.store.patch(key, &patch).await
    }

    async fn read(&self, key: &str) -> StoreResult<Option<SessionRecord>> {
        self.check()?;
        Ok(self.store.get(key).await)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.store.delete(key).await;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> StoreResult<RecordSubscription> {
        self.check()?;
        let (subscription, task) = self.store.spawn_record_feed(key.to_string()).await;
        self.track(task);
        Ok(subscription)
    }

    async fn subscribe_collection(&self, prefix: &str) -> StoreResult<CollectionSubscription> {
        self.check()?;
        let (subscription, task) = self.store.spawn_collection_feed(prefix.to_string()).await;
        self.track(task);
        Ok(subscription)
    }

    async fn register_cleanup_on_disconnect(&self, key: &str, patch: Patch) -> StoreResult<()> {
        self.check()?;
        self.store.register_cleanup(&self.id, key, patch).await;
        Ok(())
    }

    async fn cancel_cleanup_on_disconnect(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.store.cancel_cleanup(&self.id, key).await;
        Ok(())
    }
}
