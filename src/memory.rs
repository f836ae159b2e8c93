//! In-process registry.
//!
//! Holds the whole tree in memory and fans changes out to subscribers. Used by
//! the test suite and by `REGISTRY_URL=memory://` for a single-console
//! rehearsal. Failure and race injection hooks let tests reproduce what a
//! flaky network or a second operator would do.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::{
    self, lookup, paths_overlap, segments, Registry, RegistryError, Snapshot, SUBSCRIPTION_BUFFER,
};

struct Subscriber {
    path: Vec<String>,
    last: Snapshot,
    tx: mpsc::Sender<Snapshot>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    subscribers: Vec<Subscriber>,
    fail_reads: bool,
    fail_writes: bool,
    /// Exact paths whose writes fail even while `fail_writes` is off.
    failing_paths: Vec<String>,
    /// Writes from a simulated rival session, applied right before the next
    /// conditional write is evaluated.
    interleaved: VecDeque<(String, Value)>,
    writes: u64,
}

/// Pending notifications collected under the lock and delivered after it is
/// released.
type Outbox = Vec<(mpsc::Sender<Snapshot>, Snapshot)>;

impl Inner {
    fn apply(&mut self, path: &[&str], value: Value) -> Outbox {
        registry::write(&mut self.root, path, value);
        self.writes += 1;

        self.subscribers.retain(|s| !s.tx.is_closed());
        let mut outbox = Vec::new();
        for sub in &mut self.subscribers {
            let watched: Vec<&str> = sub.path.iter().map(String::as_str).collect();
            if !paths_overlap(&watched, path) {
                continue;
            }
            let current = lookup(&self.root, &watched).cloned();
            if current != sub.last {
                sub.last = current.clone();
                outbox.push((sub.tx.clone(), current));
            }
        }
        outbox
    }

    fn refuses(&self, path: &[&str]) -> bool {
        self.fail_writes
            || self
                .failing_paths
                .iter()
                .any(|failing| segments(failing).is_ok_and(|parts| parts == path))
    }

    fn drain_interleaved(&mut self) -> Result<Outbox, RegistryError> {
        let mut outbox = Vec::new();
        while let Some((path, value)) = self.interleaved.pop_front() {
            let parts = segments(&path)?;
            outbox.extend(self.apply(&parts, value));
        }
        Ok(outbox)
    }
}

async fn deliver(outbox: Outbox) {
    for (tx, snapshot) in outbox {
        if tx.send(snapshot).await.is_err() {
            debug!("Subscriber dropped before delivery");
        }
    }
}

/// Registry kept entirely in process memory. Cloning shares the tree.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing tree.
    pub fn with_root(root: Value) -> Self {
        let registry = Self::new();
        registry.lock().root = root;
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The whole tree as it stands.
    pub fn root(&self) -> Value {
        self.lock().root.clone()
    }

    /// Make subsequent reads fail as if the connection dropped.
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Make subsequent writes fail as if the connection dropped.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make writes to exactly `path` fail, leaving every other path writable.
    pub fn fail_writes_at(&self, path: &str, fail: bool) {
        let mut inner = self.lock();
        inner.failing_paths.retain(|failing| failing != path);
        if fail {
            inner.failing_paths.push(path.to_string());
        }
    }

    /// Queue a rival write that lands just before the next conditional write
    /// is checked.
    pub fn interleave(&self, path: &str, value: Value) {
        self.lock().interleaved.push_back((path.to_string(), value));
    }

    /// Number of writes applied so far, rival writes included.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, path: &str) -> Result<Snapshot, RegistryError> {
        let parts = segments(path)?;
        let inner = self.lock();
        if inner.fail_reads {
            return Err(RegistryError::Unavailable);
        }
        Ok(lookup(&inner.root, &parts).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), RegistryError> {
        let parts = segments(path)?;
        let outbox = {
            let mut inner = self.lock();
            if inner.refuses(&parts) {
                return Err(RegistryError::Unavailable);
            }
            inner.apply(&parts, value)
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), RegistryError> {
        self.set(path, Value::Null).await
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: &Snapshot,
        value: Value,
    ) -> Result<bool, RegistryError> {
        let parts = segments(path)?;
        let (written, outbox) = {
            let mut inner = self.lock();
            if inner.refuses(&parts) {
                return Err(RegistryError::Unavailable);
            }
            let mut outbox = inner.drain_interleaved()?;
            let current = lookup(&inner.root, &parts).cloned();
            if current == *expected {
                outbox.extend(inner.apply(&parts, value));
                (true, outbox)
            } else {
                (false, outbox)
            }
        };
        deliver(outbox).await;
        Ok(written)
    }

    async fn subscribe(&self, path: &str) -> Result<mpsc::Receiver<Snapshot>, RegistryError> {
        let parts = segments(path)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let current = {
            let mut inner = self.lock();
            let current = lookup(&inner.root, &parts).cloned();
            inner.subscribers.push(Subscriber {
                path: parts.iter().map(|s| s.to_string()).collect(),
                last: current.clone(),
                tx: tx.clone(),
            });
            current
        };
        if tx.send(current).await.is_err() {
            debug!(path, "Subscriber dropped before initial snapshot");
        }
        Ok(rx)
    }
}
