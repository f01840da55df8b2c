//! Debounced snapshot persistence.
//!
//! Every new cache entry calls [`PersistHandle::schedule`]. A single
//! background task owns the timer: each schedule re-arms it, and only the
//! final firing writes one snapshot of all valid entries. There is never
//! more than one write pending.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{ResolutionCache, now_epoch_ms};
use crate::store::SnapshotStore;

/// Default quiet period before a scheduled write fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

enum PersistCommand {
    Schedule,
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence task. Dropping every handle flushes any pending
/// write and stops the task.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl std::fmt::Debug for PersistCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => f.write_str("Schedule"),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl PersistHandle {
    /// Spawn the persistence task on the current tokio runtime.
    pub fn spawn(
        cache: Arc<Mutex<ResolutionCache>>,
        store: Arc<dyn SnapshotStore>,
        storage_key: impl Into<String>,
        debounce: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Persister {
            cache,
            store,
            storage_key: storage_key.into(),
            debounce,
        };
        let task = tokio::spawn(worker.run(rx));
        (Self { tx }, task)
    }

    /// (Re)arm the debounce timer.
    pub fn schedule(&self) {
        if self.tx.send(PersistCommand::Schedule).is_err() {
            warn!("persistence task is gone; snapshot not scheduled");
        }
    }

    /// Write any pending snapshot now and wait for it.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct Persister {
    cache: Arc<Mutex<ResolutionCache>>,
    store: Arc<dyn SnapshotStore>,
    storage_key: String,
    debounce: Duration,
}

impl Persister {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                PersistCommand::Flush(ack) => {
                    // Nothing scheduled, nothing to write.
                    let _ = ack.send(());
                }
                PersistCommand::Schedule => {
                    let mut acks = Vec::new();
                    let mut closed = false;
                    loop {
                        match tokio::time::timeout(self.debounce, rx.recv()).await {
                            Ok(Some(PersistCommand::Schedule)) => {}
                            Ok(Some(PersistCommand::Flush(ack))) => {
                                acks.push(ack);
                                break;
                            }
                            Ok(None) => {
                                closed = true;
                                break;
                            }
                            Err(_elapsed) => break,
                        }
                    }
                    self.write().await;
                    for ack in acks {
                        let _ = ack.send(());
                    }
                    if closed {
                        return;
                    }
                }
            }
        }
    }

    async fn write(&self) {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.snapshot(now_epoch_ms())
        };
        let entries = snapshot.as_object().map_or(0, serde_json::Map::len);
        match self.store.set(&self.storage_key, snapshot).await {
            Ok(()) => debug!(entries, storage_key = %self.storage_key, "cache snapshot persisted"),
            Err(err) => warn!(
                error = %err,
                storage_key = %self.storage_key,
                "cache snapshot write failed; continuing in memory"
            ),
        }
    }
}
