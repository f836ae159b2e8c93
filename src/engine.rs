//! Draw engine: one spin-to-commit cycle at a time.
//!
//! 1. **Preview**: the next open slot, computed from the replica. No number
//!    is shown before the wheel stops.
//! 2. **Spin**: re-read counts and winners from the registry, pick the slot,
//!    freeze the wheel layout and start the animation.
//! 3. **Land**: the frame loop samples the animation; the landing frame maps
//!    the final angle to a number.
//! 4. **Commit**: re-read the board, write the number into whatever slot is
//!    open *now* with a conditional write, retrying on conflict.
//!
//! A winner is announced even if persistence fails; the next registry push is
//! the source of truth for the board.
//!
//! Landing needs the engine; committing does not. [`run_frames`] lands under
//! the engine lock and settles the [`PendingDraw`] after releasing it, so
//! readers are never queued behind registry round trips. The draw counts as
//! in flight until it settles.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::allocator::next_slot;
use crate::metrics::DrawMetrics;
use crate::pool::{arrange, eligible_pool, shuffle};
use crate::registry::{paths, Registry, RegistryError, Snapshot};
use crate::spin::{
    wheel_segments, Advance, Landing, SpinAnimator, SpinError, SpinSettings, SpinTarget,
    SpinTiming, DEFAULT_TURNS,
};
use crate::sync::{decode_node, Replica};
use crate::tiers::{Slot, TierCounts, WinnerBoard};

/// Capacity of the draw event channel.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DrawError {
    #[error("a spin is already in flight")]
    AlreadySpinning,
    #[error("no eligible numbers left to draw")]
    EmptyPool,
    #[error("every prize slot is already filled")]
    NoOpenSlot,
    #[error("slot {0} is being drawn right now")]
    SlotInFlight(Slot),
    #[error("slot {0} has no winner")]
    SlotEmpty(Slot),
    #[error("slot {0} does not exist")]
    IndexOutOfRange(Slot),
    #[error("this action needs confirmation")]
    NotConfirmed,
    #[error("the winner board kept changing, gave up after {0} attempts")]
    Contended(u32),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<SpinError> for DrawError {
    fn from(e: SpinError) -> Self {
        match e {
            SpinError::AlreadySpinning => DrawError::AlreadySpinning,
            SpinError::EmptyWheel => DrawError::EmptyPool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Winner {
    pub number: String,
    pub email: Option<String>,
    /// Slot written, or the one the failed write was aimed at.
    pub slot: Slot,
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidReason {
    /// The pointer stopped on the padding segment of an odd pool.
    EmptySegment,
    /// Another console awarded the same number while the wheel turned.
    AlreadyWon,
    /// Every slot filled up while the wheel turned.
    NoOpenSlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DrawOutcome {
    Winner(Winner),
    Void { reason: VoidReason },
}

/// Fan-out notifications for the celebration hook and logs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DrawEvent {
    SpinStarted {
        slot: Slot,
        turns: u32,
        duration_ms: u64,
        pool_size: usize,
    },
    Finished(DrawOutcome),
    Undone {
        slot: Slot,
        number: String,
    },
    Reset,
}

/// Engine tuning that does not live in the registry.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub timing: SpinTiming,
    /// Turns for tiers the stored settings leave unset.
    pub default_turns: u32,
    /// Conditional write attempts per commit, undo included.
    pub commit_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timing: SpinTiming::default(),
            default_turns: DEFAULT_TURNS,
            commit_attempts: 5,
        }
    }
}

/// Wheel state for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct WheelView {
    pub rotation: f64,
    pub spinning: bool,
    pub segments: Vec<Option<String>>,
    pub target: Option<SpinTarget>,
}

/// Counts and winners as read from the registry just now.
struct Authoritative {
    counts: TierCounts,
    board: WinnerBoard,
    /// Raw winners node, the expectation for the conditional write.
    snapshot: Snapshot,
}

enum Commit {
    Written(Slot),
    AlreadyWon,
    NoOpenSlot,
    Failed(Slot),
}

pub struct DrawEngine {
    registry: Arc<dyn Registry>,
    replica: watch::Receiver<Replica>,
    animator: SpinAnimator,
    options: EngineOptions,
    rng: StdRng,
    /// Shuffled wheel order; empty means default order.
    display_order: Vec<String>,
    events: broadcast::Sender<DrawEvent>,
    metrics: Arc<DrawMetrics>,
    /// Set from landing until the landed draw settles.
    settling: Arc<AtomicBool>,
}

impl DrawEngine {
    pub fn new(
        registry: Arc<dyn Registry>,
        replica: watch::Receiver<Replica>,
        options: EngineOptions,
        metrics: Arc<DrawMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            replica,
            animator: SpinAnimator::new(),
            options,
            rng: StdRng::from_entropy(),
            display_order: Vec::new(),
            events,
            metrics,
            settling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the randomness source.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DrawEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<DrawMetrics> {
        &self.metrics
    }

    /// True from spin start until the landed number has been committed.
    pub fn is_spinning(&self) -> bool {
        self.animator.is_spinning() || self.settling.load(Ordering::Acquire)
    }

    /// Slot the next spin is expected to fill. Placeholder only: the slot
    /// actually filled is decided again at spin and commit time.
    pub fn preview(&self) -> Option<Slot> {
        let replica = self.replica.borrow();
        next_slot(&replica.counts, &replica.board)
    }

    /// Eligible numbers in current display order.
    pub fn wheel(&self) -> Vec<String> {
        arrange(&self.replica.borrow().pool(), &self.display_order)
    }

    /// Reorder the wheel. Membership and odds are unaffected.
    pub fn shuffle_wheel(&mut self) -> Vec<String> {
        self.display_order = shuffle(&self.wheel(), &mut self.rng);
        self.display_order.clone()
    }

    pub fn view(&self) -> WheelView {
        let target = self.animator.target().cloned();
        let segments = match &target {
            Some(target) => target.segments.clone(),
            None => wheel_segments(&self.wheel()),
        };
        WheelView {
            rotation: self.animator.rotation(),
            spinning: target.is_some(),
            segments,
            target,
        }
    }

    /// Start a draw.
    #[instrument(skip_all)]
    pub async fn spin(&mut self, now: Instant) -> Result<SpinTarget, DrawError> {
        if self.is_spinning() {
            return Err(DrawError::AlreadySpinning);
        }

        let current = self.fetch().await?;
        let (pool, settings) = {
            let replica = self.replica.borrow();
            (
                eligible_pool(replica.numbers(), &current.board),
                replica.spin.clone(),
            )
        };
        if pool.is_empty() {
            return Err(DrawError::EmptyPool);
        }
        let slot = next_slot(&current.counts, &current.board).ok_or(DrawError::NoOpenSlot)?;

        let turns = settings.turns_for(slot.tier, self.options.default_turns);
        let segments = wheel_segments(&arrange(&pool, &self.display_order));
        let target = self.animator.start(
            now,
            slot,
            turns,
            segments,
            &self.options.timing,
            &mut self.rng,
        )?;

        self.metrics.record_spin_started();
        info!(
            slot = %slot,
            turns,
            pool = pool.len(),
            duration_ms = target.duration.as_millis() as u64,
            "Spin started"
        );
        self.emit(DrawEvent::SpinStarted {
            slot,
            turns,
            duration_ms: target.duration.as_millis() as u64,
            pool_size: pool.len(),
        });
        Ok(target)
    }

    /// Advance the animation to `now`. Returns the outcome on the frame the
    /// wheel comes to rest, `None` on every other frame.
    pub async fn frame(&mut self, now: Instant) -> Option<DrawOutcome> {
        let pending = self.land(now)?;
        Some(pending.settle().await)
    }

    /// Advance the animation to `now`, handing back the landed draw on the
    /// frame the wheel comes to rest.
    pub fn land(&mut self, now: Instant) -> Option<PendingDraw> {
        let Advance::Landed(landing) = self.animator.advance(now) else {
            return None;
        };
        self.metrics.record_spin_completed(landing.target.duration);
        self.settling.store(true, Ordering::Release);
        Some(PendingDraw {
            landing,
            committer: Committer {
                registry: self.registry.clone(),
                replica: self.replica.clone(),
                metrics: self.metrics.clone(),
                events: self.events.clone(),
                attempts: self.options.commit_attempts,
            },
            settling: Settling(self.settling.clone()),
        })
    }

    /// Return a filled slot to the pool. The registrant is kept.
    #[instrument(skip(self, slot), fields(slot = %slot))]
    pub async fn undo(&mut self, slot: Slot, confirmed: bool) -> Result<String, DrawError> {
        if self.animator.target().is_some_and(|t| t.slot == slot) {
            warn!("Refusing to undo the slot being drawn");
            return Err(DrawError::SlotInFlight(slot));
        }
        if !confirmed {
            return Err(DrawError::NotConfirmed);
        }

        for attempt in 1..=self.options.commit_attempts {
            let current = self.fetch().await?;
            if slot.index >= current.counts[slot.tier] as usize {
                return Err(DrawError::IndexOutOfRange(slot));
            }
            let mut board = current.board;
            let Some(number) = board.clear(slot) else {
                return Err(DrawError::SlotEmpty(slot));
            };

            match self
                .registry
                .compare_and_set(paths::PRIZE_WINNERS, &current.snapshot, board.to_value())
                .await
            {
                Ok(true) => {
                    self.metrics.record_undo();
                    info!(number = %number, "Slot returned to the pool");
                    self.emit(DrawEvent::Undone {
                        slot,
                        number: number.clone(),
                    });
                    return Ok(number);
                }
                Ok(false) => {
                    self.metrics.record_conflict();
                    warn!(attempt, "Winner board changed underneath, retrying undo");
                }
                Err(e) => {
                    error!(error = %e, "Failed to persist undo");
                    return Err(e.into());
                }
            }
        }
        Err(DrawError::Contended(self.options.commit_attempts))
    }

    /// Empty every slot using the current counts.
    #[instrument(skip(self))]
    pub async fn reset_all(&mut self, confirmed: bool) -> Result<(), DrawError> {
        if !confirmed {
            return Err(DrawError::NotConfirmed);
        }
        let current = self.fetch().await?;
        self.write_board(&WinnerBoard::empty(&current.counts)).await?;
        self.metrics.record_reset();
        info!(slots = current.counts.total(), "Winner board reset");
        self.emit(DrawEvent::Reset);
        Ok(())
    }

    /// Store new slot counts. Changing the counts empties the board.
    #[instrument(skip(self))]
    pub async fn configure_tiers(&mut self, counts: TierCounts) -> Result<(), DrawError> {
        if self.is_spinning() {
            return Err(DrawError::AlreadySpinning);
        }
        let value = serde_json::to_value(&counts).map_err(RegistryError::from)?;
        // Board first: if the counts write fails, the old counts stand over an
        // empty board rather than new counts over old winners.
        self.write_board(&WinnerBoard::empty(&counts)).await?;
        self.registry
            .set(paths::PRIZE_COUNTS, value)
            .await
            .inspect_err(|e| error!(error = %e, "Failed to store prize counts"))?;
        info!(slots = counts.total(), "Prize tiers configured");
        self.emit(DrawEvent::Reset);
        Ok(())
    }

    pub async fn configure_spin(&mut self, settings: SpinSettings) -> Result<(), DrawError> {
        let value = serde_json::to_value(&settings).map_err(RegistryError::from)?;
        self.registry
            .set(paths::SPIN_CONFIG, value)
            .await
            .inspect_err(|e| error!(error = %e, "Failed to store spin settings"))?;
        info!(turns = settings.turns, "Spin settings stored");
        Ok(())
    }

    async fn write_board(&self, board: &WinnerBoard) -> Result<(), RegistryError> {
        self.registry
            .set(paths::PRIZE_WINNERS, board.to_value())
            .await
            .inspect_err(|e| error!(error = %e, "Failed to store winner board"))
    }

    async fn fetch(&self) -> Result<Authoritative, RegistryError> {
        fetch(self.registry.as_ref()).await
    }

    fn emit(&self, event: DrawEvent) {
        // No receivers is fine; nobody is celebrating.
        let _ = self.events.send(event);
    }
}

/// Read counts and winners from the registry, bypassing the replica.
async fn fetch(registry: &dyn Registry) -> Result<Authoritative, RegistryError> {
    let counts_snapshot = registry
        .get(paths::PRIZE_COUNTS)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to read prize counts"))?;
    let snapshot = registry
        .get(paths::PRIZE_WINNERS)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to read winner board"))?;

    let counts: TierCounts = decode_node(paths::PRIZE_COUNTS, counts_snapshot.as_ref());
    let mut board: WinnerBoard = decode_node(paths::PRIZE_WINNERS, snapshot.as_ref());
    board.reconcile(&counts);
    Ok(Authoritative {
        counts,
        board,
        snapshot,
    })
}

/// Clears the engine's in-flight flag when dropped.
struct Settling(Arc<AtomicBool>);

impl Drop for Settling {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A wheel that has come to rest, its number not yet committed.
///
/// Dropping it unsettled abandons the number and frees the engine.
pub struct PendingDraw {
    landing: Landing,
    committer: Committer,
    settling: Settling,
}

impl PendingDraw {
    /// Commit the landed number and announce the outcome.
    pub async fn settle(self) -> DrawOutcome {
        let PendingDraw {
            landing,
            committer,
            settling,
        } = self;
        let outcome = committer.finish(landing).await;
        drop(settling);
        committer.emit(DrawEvent::Finished(outcome.clone()));
        outcome
    }
}

/// Everything a landed draw needs to reach the registry.
struct Committer {
    registry: Arc<dyn Registry>,
    replica: watch::Receiver<Replica>,
    metrics: Arc<DrawMetrics>,
    events: broadcast::Sender<DrawEvent>,
    attempts: u32,
}

impl Committer {
    async fn finish(&self, landing: Landing) -> DrawOutcome {
        let anticipated = landing.target.slot;
        let Some(number) = landing.number else {
            info!(segment = landing.segment, "Wheel stopped on the empty segment");
            return self.void(VoidReason::EmptySegment);
        };

        let (slot, persisted) = match self.commit(&number, anticipated).await {
            Commit::Written(slot) => {
                self.metrics.record_commit();
                (slot, true)
            }
            Commit::AlreadyWon => return self.void(VoidReason::AlreadyWon),
            Commit::NoOpenSlot => return self.void(VoidReason::NoOpenSlot),
            Commit::Failed(slot) => {
                self.metrics.record_commit_failure();
                (slot, false)
            }
        };

        let email = self.lookup_email(&number).await;
        info!(number = %number, slot = %slot, persisted, "Winner drawn");
        DrawOutcome::Winner(Winner {
            number,
            email,
            slot,
            persisted,
        })
    }

    fn void(&self, reason: VoidReason) -> DrawOutcome {
        self.metrics.record_void();
        DrawOutcome::Void { reason }
    }

    /// Write `number` into the first slot open at commit time.
    #[instrument(skip(self, anticipated), fields(anticipated = %anticipated))]
    async fn commit(&self, number: &str, anticipated: Slot) -> Commit {
        let mut slot = anticipated;
        for attempt in 1..=self.attempts {
            let current = match fetch(self.registry.as_ref()).await {
                Ok(current) => current,
                Err(_) => return Commit::Failed(slot),
            };
            if current.board.contains(number) {
                warn!(number, "Number was awarded by another console during the spin");
                return Commit::AlreadyWon;
            }
            let Some(open) = next_slot(&current.counts, &current.board) else {
                warn!("No open slot left at commit time");
                return Commit::NoOpenSlot;
            };
            if open != anticipated {
                info!(slot = %open, "Anticipated slot was taken, committing to the next open one");
            }
            slot = open;

            let mut board = current.board;
            board.fill(slot, number);
            match self
                .registry
                .compare_and_set(paths::PRIZE_WINNERS, &current.snapshot, board.to_value())
                .await
            {
                Ok(true) => return Commit::Written(slot),
                Ok(false) => {
                    self.metrics.record_conflict();
                    warn!(attempt, slot = %slot, "Winner board changed underneath, retrying");
                }
                Err(e) => {
                    error!(slot = %slot, error = %e, "Failed to persist winner");
                    return Commit::Failed(slot);
                }
            }
        }
        error!(
            attempts = self.attempts,
            "Giving up on winner after repeated conflicts"
        );
        Commit::Failed(slot)
    }

    async fn lookup_email(&self, number: &str) -> Option<String> {
        match self.registry.get(&paths::registrant(number)).await {
            Ok(Some(record)) => record
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                warn!(number, error = %e, "Email lookup failed, using replica");
                self.replica.borrow().email_of(number).map(str::to_string)
            }
        }
    }

    fn emit(&self, event: DrawEvent) {
        let _ = self.events.send(event);
    }
}

/// Sample the engine every `period`, standing in for the display refresh.
/// The engine lock is held only to land; committing happens after release.
/// Runs until the task is dropped.
pub async fn run_frames(engine: Arc<Mutex<DrawEngine>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let pending = engine.lock().await.land(Instant::now());
        if let Some(pending) = pending {
            pending.settle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use crate::registration::register;
    use crate::tiers::{Tier, TierMap};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::{mpsc, Notify};

    /// Holds every conditional write until the test releases it.
    struct Gated {
        inner: Arc<MemoryRegistry>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Registry for Gated {
        async fn get(&self, path: &str) -> Result<Snapshot, RegistryError> {
            self.inner.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> Result<(), RegistryError> {
            self.inner.set(path, value).await
        }

        async fn remove(&self, path: &str) -> Result<(), RegistryError> {
            self.inner.remove(path).await
        }

        async fn compare_and_set(
            &self,
            path: &str,
            expected: &Snapshot,
            value: Value,
        ) -> Result<bool, RegistryError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.compare_and_set(path, expected, value).await
        }

        async fn subscribe(&self, path: &str) -> Result<mpsc::Receiver<Snapshot>, RegistryError> {
            self.inner.subscribe(path).await
        }
    }

    struct Harness {
        registry: Arc<MemoryRegistry>,
        replica: watch::Sender<Replica>,
        engine: DrawEngine,
    }

    impl Harness {
        async fn new(numbers: &[&str], counts: [u32; 5], seed: u64) -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            for (i, number) in numbers.iter().enumerate() {
                register(registry.as_ref(), &format!("p{number}@x.io"), number, i as i64)
                    .await
                    .unwrap();
            }
            let counts: TierCounts = TierMap::from_fn(|tier| counts[tier as usize]);
            registry
                .set(paths::PRIZE_COUNTS, serde_json::to_value(&counts).unwrap())
                .await
                .unwrap();

            let (replica, rx) = watch::channel(Replica::load(registry.as_ref()).await.unwrap());
            let options = EngineOptions {
                timing: SpinTiming {
                    per_turn: Duration::from_millis(10),
                    deceleration_turns: 2,
                },
                ..EngineOptions::default()
            };
            let engine = DrawEngine::new(registry.clone(), rx, options, Arc::new(DrawMetrics::new()))
                .with_rng(StdRng::seed_from_u64(seed));
            Self {
                registry,
                replica,
                engine,
            }
        }

        /// What the sync task would have pushed by now.
        async fn refresh(&self) {
            self.replica
                .send_replace(Replica::load(self.registry.as_ref()).await.unwrap());
        }

        async fn board(&self) -> WinnerBoard {
            let replica = Replica::load(self.registry.as_ref()).await.unwrap();
            replica.board
        }

        async fn draw(&mut self) -> DrawOutcome {
            let t0 = Instant::now();
            let target = self.engine.spin(t0).await.unwrap();
            assert!(self.engine.frame(t0 + target.duration / 2).await.is_none());
            let outcome = self.engine.frame(t0 + target.duration).await.unwrap();
            assert!(self.engine.frame(t0 + target.duration * 2).await.is_none());
            self.refresh().await;
            outcome
        }

        /// Spin until something other than the padding segment comes up.
        async fn draw_winner(&mut self) -> Winner {
            for _ in 0..100 {
                if let DrawOutcome::Winner(w) = self.draw().await {
                    return w;
                }
            }
            panic!("no winner in 100 spins");
        }
    }

    fn winner(outcome: DrawOutcome) -> Winner {
        match outcome {
            DrawOutcome::Winner(winner) => winner,
            other => panic!("expected a winner, got {other:?}"),
        }
    }

    const CONSOLATION_ONLY: [u32; 5] = [1, 0, 0, 0, 0];

    #[tokio::test]
    async fn full_cycle_commit_then_undo() {
        let mut h = Harness::new(&["1", "2", "3", "4", "5"], CONSOLATION_ONLY, 7).await;
        let slot = Slot::new(Tier::Consolation, 0);
        assert_eq!(h.engine.preview(), Some(slot));

        let t0 = Instant::now();
        let target = h.engine.spin(t0).await.unwrap();
        assert_eq!(target.turns, DEFAULT_TURNS);
        assert_eq!(target.slot, slot);
        // Five entries plus the padding segment.
        assert_eq!(target.segments.len(), 6);

        // Keep landing until a real number comes up; an empty segment leaves
        // nothing behind.
        let mut outcome = h.engine.frame(t0 + target.duration).await.unwrap();
        while let DrawOutcome::Void { reason } = outcome {
            assert_eq!(reason, VoidReason::EmptySegment);
            assert_eq!(h.board().await.filled_count(), 0);
            let t = Instant::now();
            let target = h.engine.spin(t).await.unwrap();
            outcome = h.engine.frame(t + target.duration).await.unwrap();
        }
        let won = winner(outcome);
        h.refresh().await;

        assert!(["1", "2", "3", "4", "5"].contains(&won.number.as_str()));
        assert_eq!(won.slot, slot);
        assert!(won.persisted);
        assert_eq!(won.email.as_deref(), Some(format!("p{}@x.io", won.number).as_str()));
        assert_eq!(h.board().await.get(slot), Some(won.number.as_str()));
        assert_eq!(h.engine.wheel().len(), 4);
        assert_eq!(h.engine.preview(), None);

        assert_eq!(h.engine.undo(slot, true).await.unwrap(), won.number);
        h.refresh().await;
        assert_eq!(h.engine.wheel().len(), 5);
        assert_eq!(h.board().await.tier(Tier::Consolation), &[None]);
        assert_eq!(h.engine.preview(), Some(slot));
    }

    #[tokio::test]
    async fn draws_never_award_a_number_twice() {
        let numbers = ["1", "2", "3", "4", "5", "6", "7", "8"];
        let mut h = Harness::new(&numbers, [3, 2, 1, 0, 1], 11).await;

        let mut winners = 0;
        for _ in 0..200 {
            if h.engine.preview().is_none() {
                break;
            }
            if let DrawOutcome::Winner(w) = h.draw().await {
                assert!(w.persisted);
                winners += 1;
            }
            let board = h.board().await;
            let filled: usize = Tier::ALL
                .into_iter()
                .map(|tier| board.tier(tier).iter().flatten().count())
                .sum();
            assert_eq!(board.won_numbers().len(), filled);
            assert_eq!(h.engine.wheel().len(), numbers.len() - winners);
        }

        let board = h.board().await;
        assert_eq!(winners, 7);
        assert_eq!(board.won_numbers().len(), 7);
        assert!(matches!(
            h.engine.spin(Instant::now()).await,
            Err(DrawError::NoOpenSlot)
        ));
    }

    #[tokio::test]
    async fn undone_number_can_win_again() {
        let mut h = Harness::new(&["1", "2"], [2, 0, 0, 0, 0], 5).await;
        let first = winner(h.draw().await);
        h.engine.undo(first.slot, true).await.unwrap();
        h.refresh().await;

        let pool: HashSet<String> = h.engine.wheel().into_iter().collect();
        assert!(pool.contains(&first.number));
        assert_eq!(pool.len(), 2);
        assert!(h.board().await.won_numbers().is_empty());
    }

    #[tokio::test]
    async fn reset_requires_confirmation_and_empties_everything() {
        let mut h = Harness::new(&["1", "2", "3", "4"], [2, 1, 0, 0, 0], 3).await;
        h.draw_winner().await;
        h.draw_winner().await;

        assert!(matches!(
            h.engine.reset_all(false).await,
            Err(DrawError::NotConfirmed)
        ));
        assert_eq!(h.board().await.filled_count(), 2);

        h.engine.reset_all(true).await.unwrap();
        h.refresh().await;
        let board = h.board().await;
        assert_eq!(board.filled_count(), 0);
        assert_eq!(board.tier(Tier::Consolation).len(), 2);
        assert_eq!(h.engine.wheel(), vec!["1", "2", "3", "4"]);
        assert_eq!(h.engine.metrics().to_json()["resets"], 1);
    }

    #[tokio::test]
    async fn late_commit_moves_to_the_next_open_slot() {
        let mut h = Harness::new(&["1", "2", "3", "4"], [2, 0, 0, 0, 0], 21).await;
        let t0 = Instant::now();
        let target = h.engine.spin(t0).await.unwrap();
        assert_eq!(target.slot, Slot::new(Tier::Consolation, 0));

        // Another console fills slot 0 while this wheel is turning.
        h.registry
            .set(paths::PRIZE_WINNERS, json!({"consolation": ["99", null]}))
            .await
            .unwrap();

        let won = winner(h.engine.frame(t0 + target.duration).await.unwrap());
        assert_eq!(won.slot, Slot::new(Tier::Consolation, 1));
        let board = h.board().await;
        assert_eq!(board.get(Slot::new(Tier::Consolation, 0)), Some("99"));
        assert_eq!(board.get(won.slot), Some(won.number.as_str()));
    }

    #[tokio::test]
    async fn conflicting_write_is_retried() {
        let mut h = Harness::new(&["1", "2", "3", "4"], [2, 0, 0, 0, 0], 8).await;
        let t0 = Instant::now();
        let target = h.engine.spin(t0).await.unwrap();

        h.registry
            .interleave(paths::PRIZE_WINNERS, json!({"consolation": ["99", null]}));
        let won = winner(h.engine.frame(t0 + target.duration).await.unwrap());

        assert!(won.persisted);
        assert_eq!(won.slot, Slot::new(Tier::Consolation, 1));
        assert_eq!(h.engine.metrics().to_json()["commit_conflicts"], 1);
        assert_eq!(h.board().await.filled_count(), 2);
    }

    #[tokio::test]
    async fn number_awarded_elsewhere_voids_the_draw() {
        let mut h = Harness::new(&["1", "2"], [3, 0, 0, 0, 0], 2).await;
        let t0 = Instant::now();
        let target = h.engine.spin(t0).await.unwrap();

        // Another console awards both numbers mid-spin.
        h.registry
            .set(paths::PRIZE_WINNERS, json!({"consolation": ["1", "2", null]}))
            .await
            .unwrap();

        let outcome = h.engine.frame(t0 + target.duration).await.unwrap();
        assert_eq!(
            outcome,
            DrawOutcome::Void {
                reason: VoidReason::AlreadyWon
            }
        );
        assert_eq!(h.board().await.filled_count(), 2);
    }

    #[tokio::test]
    async fn empty_segment_voids_without_writing() {
        // One entry plus padding: about half of all spins land on padding.
        let mut seen_void = false;
        for seed in 0..64 {
            let mut h = Harness::new(&["1"], CONSOLATION_ONLY, seed).await;
            let writes = h.registry.write_count();
            let t0 = Instant::now();
            let target = h.engine.spin(t0).await.unwrap();
            assert_eq!(target.segments, vec![Some("1".to_string()), None]);

            match h.engine.frame(t0 + target.duration).await.unwrap() {
                DrawOutcome::Void { reason } => {
                    assert_eq!(reason, VoidReason::EmptySegment);
                    assert_eq!(h.registry.write_count(), writes);
                    assert!(!h.engine.is_spinning());
                    seen_void = true;
                    break;
                }
                DrawOutcome::Winner(w) => assert_eq!(w.number, "1"),
            }
        }
        assert!(seen_void);
    }

    #[tokio::test]
    async fn failed_write_still_announces_the_winner() {
        let mut h = Harness::new(&["1", "2"], CONSOLATION_ONLY, 4).await;
        let mut events = h.engine.subscribe();
        let t0 = Instant::now();
        let target = h.engine.spin(t0).await.unwrap();

        h.registry.fail_writes(true);
        let won = winner(h.engine.frame(t0 + target.duration).await.unwrap());

        assert!(!won.persisted);
        assert_eq!(won.slot, Slot::new(Tier::Consolation, 0));
        assert_eq!(won.email.as_deref(), Some(format!("p{}@x.io", won.number).as_str()));
        assert_eq!(h.board().await.filled_count(), 0);
        assert_eq!(h.engine.metrics().to_json()["commit_failures"], 1);

        assert!(matches!(events.try_recv(), Ok(DrawEvent::SpinStarted { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(DrawEvent::Finished(DrawOutcome::Winner(w))) if !w.persisted
        ));
    }

    #[tokio::test]
    async fn undo_guards() {
        let mut h = Harness::new(&["1", "2", "3", "4"], [2, 0, 0, 0, 0], 6).await;
        let first = winner(h.draw().await);

        assert!(matches!(
            h.engine.undo(first.slot, false).await,
            Err(DrawError::NotConfirmed)
        ));
        assert!(matches!(
            h.engine.undo(Slot::new(Tier::Consolation, 1), true).await,
            Err(DrawError::SlotEmpty(_))
        ));
        assert!(matches!(
            h.engine.undo(Slot::new(Tier::Special, 0), true).await,
            Err(DrawError::IndexOutOfRange(_))
        ));

        let target = h.engine.spin(Instant::now()).await.unwrap();
        assert!(matches!(
            h.engine.undo(target.slot, true).await,
            Err(DrawError::SlotInFlight(_))
        ));
        // A different, filled slot may still be undone mid-spin.
        assert_eq!(h.engine.undo(first.slot, true).await.unwrap(), first.number);
        assert_eq!(h.board().await.filled_count(), 0);
    }

    #[tokio::test]
    async fn spin_preconditions() {
        let mut h = Harness::new(&[], CONSOLATION_ONLY, 1).await;
        assert!(matches!(
            h.engine.spin(Instant::now()).await,
            Err(DrawError::EmptyPool)
        ));

        let mut h = Harness::new(&["1", "2"], [0; 5], 1).await;
        assert!(matches!(
            h.engine.spin(Instant::now()).await,
            Err(DrawError::NoOpenSlot)
        ));

        let mut h = Harness::new(&["1", "2"], CONSOLATION_ONLY, 1).await;
        h.engine.spin(Instant::now()).await.unwrap();
        assert!(matches!(
            h.engine.spin(Instant::now()).await,
            Err(DrawError::AlreadySpinning)
        ));
    }

    #[tokio::test]
    async fn per_tier_turns_come_from_settings() {
        let mut h = Harness::new(&["1", "2"], [0, 0, 0, 0, 1], 1).await;
        let mut settings = SpinSettings::default();
        settings.turns_by_tier[Tier::Special] = 30;
        h.engine.configure_spin(settings).await.unwrap();
        h.refresh().await;

        let target = h.engine.spin(Instant::now()).await.unwrap();
        assert_eq!(target.slot, Slot::new(Tier::Special, 0));
        assert_eq!(target.turns, 30);
    }

    #[tokio::test]
    async fn configuring_tiers_empties_the_board() {
        let mut h = Harness::new(&["1", "2"], [2, 0, 0, 0, 0], 1).await;
        winner(h.draw().await);

        let counts: TierCounts = TierMap::from_fn(|tier| if tier == Tier::First { 3 } else { 0 });
        h.engine.configure_tiers(counts).await.unwrap();
        h.refresh().await;

        let board = h.board().await;
        assert_eq!(board.filled_count(), 0);
        assert_eq!(board.tier(Tier::First).len(), 3);
        assert_eq!(h.engine.preview(), Some(Slot::new(Tier::First, 0)));
    }

    #[tokio::test]
    async fn failed_tier_change_never_leaves_old_winners_behind() {
        let mut h = Harness::new(&["1", "2", "3"], [2, 0, 0, 0, 0], 9).await;
        let won = h.draw_winner().await;
        let counts: TierCounts = TierMap::from_fn(|tier| if tier == Tier::Third { 4 } else { 0 });

        // Nothing written: the old counts and winners both stand.
        h.registry.fail_writes(true);
        assert!(matches!(
            h.engine.configure_tiers(counts.clone()).await,
            Err(DrawError::Registry(_))
        ));
        h.registry.fail_writes(false);
        let board = h.board().await;
        assert_eq!(board.get(won.slot), Some(won.number.as_str()));
        assert_eq!(board.tier(Tier::Consolation).len(), 2);

        // Board written, counts refused: old counts over an empty board.
        h.registry.fail_writes_at(paths::PRIZE_COUNTS, true);
        assert!(matches!(
            h.engine.configure_tiers(counts).await,
            Err(DrawError::Registry(_))
        ));
        h.registry.fail_writes_at(paths::PRIZE_COUNTS, false);
        let board = h.board().await;
        assert_eq!(board.filled_count(), 0);
        assert_eq!(board.tier(Tier::Consolation).len(), 2);
        assert!(board.tier(Tier::Third).is_empty());
    }

    #[tokio::test]
    async fn engine_stays_available_while_a_winner_is_written() {
        let h = Harness::new(&["1", "2"], CONSOLATION_ONLY, 17).await;
        let gated = Arc::new(Gated {
            inner: h.registry.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = DrawEngine::new(
            gated.clone(),
            h.replica.subscribe(),
            h.engine.options,
            Arc::new(DrawMetrics::new()),
        )
        .with_rng(StdRng::seed_from_u64(17));
        let engine = Arc::new(Mutex::new(engine));
        let mut events = engine.lock().await.subscribe();
        engine.lock().await.spin(Instant::now()).await.unwrap();

        let frames = tokio::spawn(run_frames(engine.clone(), Duration::from_millis(5)));
        tokio::time::timeout(Duration::from_secs(5), gated.entered.notified())
            .await
            .expect("commit never reached the registry");

        {
            let mut locked = tokio::time::timeout(Duration::from_millis(500), engine.lock())
                .await
                .expect("engine stayed locked during the commit");
            assert!(locked.is_spinning());
            assert_eq!(locked.wheel().len(), 2);
            assert!(matches!(
                locked.spin(Instant::now()).await,
                Err(DrawError::AlreadySpinning)
            ));
        }

        gated.release.notify_one();
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DrawEvent::Finished(outcome)) = events.recv().await {
                    return outcome;
                }
            }
        })
        .await
        .expect("draw never settled");
        frames.abort();

        let won = winner(outcome);
        assert!(won.persisted);
        assert!(!engine.lock().await.is_spinning());
        assert_eq!(h.board().await.get(won.slot), Some(won.number.as_str()));
    }

    #[tokio::test]
    async fn shuffle_keeps_membership_and_freezes_into_the_spin() {
        let mut h = Harness::new(&["1", "2", "3", "4", "5", "6"], CONSOLATION_ONLY, 13).await;
        let shuffled = h.engine.shuffle_wheel();
        let mut sorted = shuffled.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["1", "2", "3", "4", "5", "6"]);
        assert_eq!(h.engine.wheel(), shuffled);

        let target = h.engine.spin(Instant::now()).await.unwrap();
        let frozen: Vec<String> = target.segments.iter().flatten().cloned().collect();
        assert_eq!(frozen, shuffled);
    }

    #[tokio::test]
    async fn frame_loop_lands_the_wheel() {
        let h = Harness::new(&["1", "2"], CONSOLATION_ONLY, 17).await;
        let registry = h.registry.clone();
        let engine = Arc::new(Mutex::new(h.engine));
        let mut events = engine.lock().await.subscribe();
        engine.lock().await.spin(Instant::now()).await.unwrap();

        let frames = tokio::spawn(run_frames(engine.clone(), Duration::from_millis(5)));
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DrawEvent::Finished(outcome)) = events.recv().await {
                    return outcome;
                }
            }
        })
        .await
        .expect("wheel never stopped");
        frames.abort();

        let won = winner(event);
        assert!(!engine.lock().await.is_spinning());
        let board = Replica::load(registry.as_ref()).await.unwrap().board;
        assert_eq!(board.get(won.slot), Some(won.number.as_str()));
    }
}
