//! Shared realtime registry.
//!
//! Every piece of event state lives in one remote JSON tree that several
//! operator consoles read and write at once. The draw engine only ever talks
//! to it through [`Registry`], injected at construction, so tests run against
//! [`crate::memory::MemoryRegistry`] and production against
//! [`crate::firebase::FirebaseRegistry`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Registry node paths.
pub mod paths {
    /// `{ "<number>": { "email": "...", "timestamp": <ms> } }`
    pub const REGISTRATIONS: &str = "registration";
    pub const PRIZE_COUNTS: &str = "settings/prizeCounts";
    pub const PRIZE_WINNERS: &str = "settings/prizeWinners";
    pub const SPIN_CONFIG: &str = "settings/spinConfig";
    pub const LOCKED: &str = "settings/locked";
    pub const INVITED_EMAILS: &str = "settings/defaultMails";

    pub fn registrant(number: &str) -> String {
        format!("{REGISTRATIONS}/{number}")
    }
}

/// A node's value, `None` when the node does not exist.
pub type Snapshot = Option<Value>;

/// Capacity of each subscription channel.
pub const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(String),
    #[error("registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("registry returned malformed data: {0}")]
    Decode(String),
    #[error("invalid registry path: {0:?}")]
    InvalidPath(String),
    #[error("registry unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        RegistryError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Decode(e.to_string())
    }
}

/// Key-value realtime store addressed by slash-separated paths.
#[async_trait]
pub trait Registry: Send + Sync {
    /// One-shot read of a node.
    async fn get(&self, path: &str) -> Result<Snapshot, RegistryError>;

    /// Replace a node. Writing `null` removes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), RegistryError>;

    async fn remove(&self, path: &str) -> Result<(), RegistryError>;

    /// Replace a node only if it still holds `expected`. Returns `false`
    /// without writing when another writer got there first.
    async fn compare_and_set(
        &self,
        path: &str,
        expected: &Snapshot,
        value: Value,
    ) -> Result<bool, RegistryError>;

    /// Stream of full snapshots of a node: the current value first, then one
    /// per change. The stream ends when the registry shuts down.
    async fn subscribe(&self, path: &str) -> Result<mpsc::Receiver<Snapshot>, RegistryError>;
}

/// Split a path into its non-empty segments, rejecting characters the
/// registry reserves.
pub fn segments(path: &str) -> Result<Vec<&str>, RegistryError> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let reserved = ['.', '#', '$', '[', ']'];
    if parts.iter().any(|p| p.contains(&reserved[..])) {
        return Err(RegistryError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Whether a change at `changed` can alter the value observed at `watched`
/// (one is a prefix of the other).
pub fn paths_overlap(watched: &[&str], changed: &[&str]) -> bool {
    watched.iter().zip(changed.iter()).all(|(a, b)| a == b)
}

/// Read the node at `path` inside `root`.
pub fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, key| match node {
            Value::Object(map) => map.get(*key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}

/// Write `value` at `path` inside `root`, creating intermediate objects.
/// A `null` value deletes the node, and parents left empty are pruned, the
/// way the realtime database never stores empty containers.
pub fn write(root: &mut Value, path: &[&str], value: Value) {
    if is_empty(&value) && lookup(root, path).is_none() {
        return;
    }
    write_at(root, path, value);
}

fn write_at(node: &mut Value, path: &[&str], value: Value) {
    let Some((key, rest)) = path.split_first() else {
        *node = if is_empty(&value) { Value::Null } else { value };
        return;
    };

    let mut map = into_object(std::mem::take(node));
    let child = map.entry((*key).to_string()).or_insert(Value::Null);
    write_at(child, rest, value);
    if is_empty(child) {
        map.remove(*key);
    }
    *node = if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    };
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Arrays become index-keyed objects once a child is addressed by key;
/// scalars are replaced.
fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Map::new(),
    }
}
