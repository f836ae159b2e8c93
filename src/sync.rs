//! Local replica of the registry.
//!
//! One subscription per registry node feeds a single task that owns the
//! [`Replica`] and publishes it through a `watch` channel. The replica is
//! eventually consistent; anything that decides who wins re-reads the
//! registry first.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pool::eligible_pool;
use crate::registration::{decode_invited, decode_registrants, Registrant};
use crate::registry::{paths, Registry, RegistryError, Snapshot, SUBSCRIPTION_BUFFER};
use crate::spin::SpinSettings;
use crate::tiers::{decode_or_default, TierCounts, WinnerBoard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Registrations,
    PrizeCounts,
    PrizeWinners,
    SpinConfig,
    Locked,
    Invited,
}

impl Node {
    const ALL: [Node; 6] = [
        Node::Registrations,
        Node::PrizeCounts,
        Node::PrizeWinners,
        Node::SpinConfig,
        Node::Locked,
        Node::Invited,
    ];

    fn path(self) -> &'static str {
        match self {
            Node::Registrations => paths::REGISTRATIONS,
            Node::PrizeCounts => paths::PRIZE_COUNTS,
            Node::PrizeWinners => paths::PRIZE_WINNERS,
            Node::SpinConfig => paths::SPIN_CONFIG,
            Node::Locked => paths::LOCKED,
            Node::Invited => paths::INVITED_EMAILS,
        }
    }
}

/// Everything the console shows, as last pushed by the registry.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    pub registrants: BTreeMap<String, Registrant>,
    pub counts: TierCounts,
    /// Winner board reconciled against `counts`.
    pub board: WinnerBoard,
    pub spin: SpinSettings,
    pub locked: bool,
    pub invited: Vec<String>,
    /// Board exactly as stored. Kept so a board that arrives before its
    /// counts is not truncated to nothing.
    stored_board: WinnerBoard,
}

impl Replica {
    /// Read every node once.
    pub async fn load(registry: &dyn Registry) -> Result<Self, RegistryError> {
        let mut replica = Replica::default();
        for node in Node::ALL {
            let snapshot = registry.get(node.path()).await?;
            replica.apply(node, snapshot.as_ref());
        }
        Ok(replica)
    }

    pub fn numbers(&self) -> impl Iterator<Item = &str> {
        self.registrants.keys().map(String::as_str)
    }

    /// Numbers still eligible against the replicated board.
    pub fn pool(&self) -> Vec<String> {
        eligible_pool(self.numbers(), &self.board)
    }

    pub fn email_of(&self, number: &str) -> Option<&str> {
        self.registrants.get(number).map(|r| r.email.as_str())
    }

    fn apply(&mut self, node: Node, snapshot: Option<&Value>) {
        match node {
            Node::Registrations => self.registrants = decode_registrants(snapshot),
            Node::PrizeCounts => self.counts = decode_node(node.path(), snapshot),
            Node::PrizeWinners => self.stored_board = decode_node(node.path(), snapshot),
            Node::SpinConfig => self.spin = decode_node(node.path(), snapshot),
            Node::Locked => self.locked = snapshot.and_then(Value::as_bool).unwrap_or(false),
            Node::Invited => self.invited = decode_invited(snapshot),
        }
        if matches!(node, Node::PrizeCounts | Node::PrizeWinners) {
            self.board = self.stored_board.clone();
            self.board.reconcile(&self.counts);
        }
    }
}

/// Decode a registry node, logging and falling back to the default when the
/// stored shape is unusable.
pub(crate) fn decode_node<T: DeserializeOwned + Default>(path: &str, snapshot: Option<&Value>) -> T {
    decode_or_default(snapshot).unwrap_or_else(|e| {
        warn!(path, error = %e, "Malformed registry node, treating as absent");
        T::default()
    })
}

/// Keep `tx` up to date with the registry until every subscription ends.
pub async fn run_sync(
    registry: Arc<dyn Registry>,
    tx: watch::Sender<Replica>,
) -> Result<(), RegistryError> {
    let (merged_tx, mut merged_rx) = mpsc::channel::<(Node, Snapshot)>(SUBSCRIPTION_BUFFER);

    for node in Node::ALL {
        let mut rx = registry.subscribe(node.path()).await?;
        let merged = merged_tx.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if merged.send((node, snapshot)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(merged_tx);
    info!(nodes = Node::ALL.len(), "Registry replica subscribed");

    while let Some((node, snapshot)) = merged_rx.recv().await {
        debug!(path = node.path(), "Registry update");
        tx.send_modify(|replica| replica.apply(node, snapshot.as_ref()));
    }

    warn!("Registry subscriptions closed");
    Ok(())
}
