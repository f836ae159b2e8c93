//! Wheel spin model.
//!
//! A spin is a pure function of its start parameters: given the rotation at
//! start, the planned final rotation, the start instant and the duration, the
//! rotation at any later instant is fixed. The frame loop only samples it.
//!
//! ```text
//! final    = start - turns * 2π - offset          offset ∈ [0, 2π)
//! duration = max(0, turns - decel) * per_turn + decel * (2 * per_turn)
//! angle(t) = start + (final - start) * (1 - (1 - p)^4)   p = clamp(t / duration)
//! ```
//!
//! The wheel is drawn clockwise from angle 0 with segment `i` spanning
//! `[i * a, (i + 1) * a)` plus the current rotation, where `a = 2π / n`. The
//! pointer sits at `3π/2` (top of the canvas).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::mem;
use std::time::{Duration, Instant};

use crate::tiers::{Slot, Tier, TierMap};

/// Angle of the fixed pointer.
pub const POINTER_ANGLE: f64 = 3.0 * PI / 2.0;

/// Two angular distances closer than this are treated as a tie.
const TIE_EPSILON: f64 = 1e-9;

/// Pacing shared by every spin; turn counts are chosen per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinTiming {
    /// Time for one turn at cruising speed.
    pub per_turn: Duration,
    /// Trailing turns that run at half speed under the ease-out curve.
    pub deceleration_turns: u32,
}

impl Default for SpinTiming {
    fn default() -> Self {
        Self {
            per_turn: Duration::from_millis(1200),
            deceleration_turns: 2,
        }
    }
}

impl SpinTiming {
    pub fn duration(&self, turns: u32) -> Duration {
        let cruise = turns.saturating_sub(self.deceleration_turns);
        self.per_turn * cruise + self.per_turn * 2 * self.deceleration_turns
    }
}

/// Turns used when neither the tier nor the stored settings name a count.
pub const DEFAULT_TURNS: u32 = 15;

/// Turn counts stored at `settings/spinConfig`.
///
/// Older consoles wrote a single `{ "duration": .., "turns": .. }` record;
/// that still decodes, with `duration` ignored in favour of [`SpinTiming`].
/// A count of zero means "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpinSettings {
    pub turns: u32,
    pub turns_by_tier: TierMap<u32>,
}

impl Default for SpinSettings {
    fn default() -> Self {
        Self {
            turns: DEFAULT_TURNS,
            turns_by_tier: TierMap::default(),
        }
    }
}

impl SpinSettings {
    pub fn turns_for(&self, tier: Tier, fallback: u32) -> u32 {
        [self.turns_by_tier[tier], self.turns]
            .into_iter()
            .find(|&turns| turns > 0)
            .unwrap_or(fallback)
    }
}

/// `1 - (1 - p)^4`.
pub fn ease_out_quart(progress: f64) -> f64 {
    1.0 - (1.0 - progress).powi(4)
}

/// Fraction of `duration` covered by `elapsed`, clamped to `[0, 1]`. A zero
/// duration is already complete.
pub fn progress(elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
}

/// Rotation at `progress` along the eased path from `start` to `end`.
pub fn interpolate(start: f64, end: f64, progress: f64) -> f64 {
    start + (end - start) * ease_out_quart(progress.clamp(0.0, 1.0))
}

/// Map any angle into `[0, 2π)`.
pub fn normalize(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped >= TAU { 0.0 } else { wrapped }
}

fn circular_distance(a: f64, b: f64) -> f64 {
    let d = (normalize(a) - normalize(b)).abs();
    d.min(TAU - d)
}

/// Wheel segments for a pool. An odd pool gets one trailing empty segment so
/// the two alternating colours never meet.
pub fn wheel_segments(pool: &[String]) -> Vec<Option<String>> {
    let mut segments: Vec<Option<String>> = pool.iter().cloned().map(Some).collect();
    if segments.len() % 2 == 1 {
        segments.push(None);
    }
    segments
}

/// Index of the segment under the pointer at `rotation`.
///
/// The segment whose centre is circularly closest to the pointer wins; on a
/// tie (pointer exactly on a boundary) the lower index wins.
pub fn select_segment(rotation: f64, segment_count: usize) -> Option<usize> {
    if segment_count == 0 {
        return None;
    }
    let arc = TAU / segment_count as f64;
    let rotation = normalize(rotation);

    let mut best = (0, f64::INFINITY);
    for index in 0..segment_count {
        let centre = index as f64 * arc + arc / 2.0 + rotation;
        let distance = circular_distance(centre, POINTER_ANGLE);
        if distance < best.1 - TIE_EPSILON {
            best = (index, distance);
        }
    }
    Some(best.0)
}

/// Parameters of one in-flight spin. Ephemeral: never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SpinTarget {
    /// Slot anticipated when the spin started. The committed slot is decided
    /// again at commit time and may differ.
    pub slot: Slot,
    pub turns: u32,
    pub rotation_start: f64,
    pub rotation_end: f64,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Wheel layout frozen at spin start; the landing angle maps onto this.
    pub segments: Vec<Option<String>>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl SpinTarget {
    pub fn rotation_at(&self, now: Instant) -> f64 {
        interpolate(self.rotation_start, self.rotation_end, self.progress_at(now))
    }

    pub fn progress_at(&self, now: Instant) -> f64 {
        progress(now.saturating_duration_since(self.started_at), self.duration)
    }
}

/// Where a finished spin came to rest.
#[derive(Debug, Clone)]
pub struct Landing {
    pub target: SpinTarget,
    pub rotation: f64,
    pub segment: usize,
    /// `None` when the pointer stopped on the synthetic empty segment.
    pub number: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SpinState {
    Idle,
    Spinning(SpinTarget),
}

/// One sample of the animation.
#[derive(Debug, Clone)]
pub enum Advance {
    Idle { rotation: f64 },
    Spinning { rotation: f64, progress: f64 },
    /// Emitted exactly once per spin, on the frame that crosses completion.
    Landed(Landing),
}

#[derive(Debug, thiserror::Error)]
pub enum SpinError {
    #[error("a spin is already in flight")]
    AlreadySpinning,
    #[error("the wheel has no segments")]
    EmptyWheel,
}

/// `Idle -> Spinning -> Idle` state machine around the wheel rotation.
#[derive(Debug, Clone)]
pub struct SpinAnimator {
    rotation: f64,
    state: SpinState,
}

impl Default for SpinAnimator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinAnimator {
    pub fn new() -> Self {
        Self {
            rotation: 0.0,
            state: SpinState::Idle,
        }
    }

    /// Rotation the wheel currently rests at (or last sampled at).
    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn is_spinning(&self) -> bool {
        matches!(self.state, SpinState::Spinning(_))
    }

    pub fn target(&self) -> Option<&SpinTarget> {
        match &self.state {
            SpinState::Spinning(target) => Some(target),
            SpinState::Idle => None,
        }
    }

    /// Enter `Spinning`. The stopping offset is drawn from `rng` here so the
    /// landing position cannot be known before the operator spins.
    pub fn start<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        slot: Slot,
        turns: u32,
        segments: Vec<Option<String>>,
        timing: &SpinTiming,
        rng: &mut R,
    ) -> Result<SpinTarget, SpinError> {
        if self.is_spinning() {
            return Err(SpinError::AlreadySpinning);
        }
        if segments.is_empty() {
            return Err(SpinError::EmptyWheel);
        }

        let offset = rng.gen_range(0.0..TAU);
        let rotation_end = self.rotation - turns as f64 * TAU - offset;

        let target = SpinTarget {
            slot,
            turns,
            rotation_start: self.rotation,
            rotation_end,
            started_at: now,
            duration: timing.duration(turns),
            segments,
        };
        self.state = SpinState::Spinning(target.clone());
        Ok(target)
    }

    /// Sample the animation at `now`.
    ///
    /// The transition back to `Idle` happens inside this call, so a loop that
    /// keeps sampling after completion sees `Idle` rather than a second
    /// landing.
    pub fn advance(&mut self, now: Instant) -> Advance {
        let progress = match &self.state {
            SpinState::Idle => {
                return Advance::Idle {
                    rotation: self.rotation,
                };
            }
            SpinState::Spinning(target) => target.progress_at(now),
        };

        if progress < 1.0 {
            if let SpinState::Spinning(target) = &self.state {
                self.rotation = target.rotation_at(now);
            }
            return Advance::Spinning {
                rotation: self.rotation,
                progress,
            };
        }

        let SpinState::Spinning(target) = mem::replace(&mut self.state, SpinState::Idle) else {
            return Advance::Idle {
                rotation: self.rotation,
            };
        };
        self.rotation = target.rotation_end;

        let segment = select_segment(self.rotation, target.segments.len()).unwrap_or(0);
        let number = target
            .segments
            .get(segment)
            .cloned()
            .flatten()
            .filter(|n| !n.is_empty());

        Advance::Landed(Landing {
            rotation: self.rotation,
            segment,
            number,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn duration_splits_cruise_and_deceleration() {
        let timing = SpinTiming {
            per_turn: Duration::from_millis(1000),
            deceleration_turns: 2,
        };
        assert_eq!(timing.duration(15), Duration::from_millis(13_000 + 4_000));
        assert_eq!(timing.duration(1), Duration::from_millis(4_000));
        assert_eq!(timing.duration(0), Duration::from_millis(4_000));
    }

    #[test]
    fn interpolation_matches_quartic_ease_out() {
        let (start, end) = (1.0, -100.0);
        let duration = Duration::from_millis(8000);
        for ms in [0u64, 1000, 2000, 4000, 7999, 8000, 12000] {
            let t = Duration::from_millis(ms);
            let p = (ms as f64 / 8000.0).min(1.0);
            let expected = start + (end - start) * (1.0 - (1.0 - p).powi(4));
            let got = interpolate(start, end, progress(t, duration));
            assert!((got - expected).abs() < 1e-9, "t={ms}ms: {got} vs {expected}");
        }
    }

    #[test]
    fn zero_duration_is_complete() {
        assert_eq!(progress(Duration::ZERO, Duration::ZERO), 1.0);
    }

    #[test]
    fn odd_pools_get_an_empty_segment() {
        assert_eq!(wheel_segments(&pool(3)).len(), 4);
        assert_eq!(wheel_segments(&pool(3))[3], None);
        assert_eq!(wheel_segments(&pool(4)).len(), 4);
        assert!(wheel_segments(&[]).is_empty());
    }

    #[test]
    fn selects_segment_centred_under_pointer() {
        let n = 8;
        let arc = TAU / n as f64;
        for index in 0..n {
            // Rotate so that segment `index` is centred on the pointer.
            let rotation = POINTER_ANGLE - (index as f64 * arc + arc / 2.0);
            assert_eq!(select_segment(rotation, n), Some(index));
            assert_eq!(select_segment(rotation - 7.0 * TAU, n), Some(index));
        }
    }

    #[test]
    fn boundary_tie_goes_to_lower_index() {
        let n = 6;
        let arc = TAU / n as f64;
        for index in 0..n - 1 {
            // Boundary between `index` and `index + 1` under the pointer.
            let rotation = POINTER_ANGLE - (index + 1) as f64 * arc;
            assert_eq!(select_segment(rotation, n), Some(index));
        }
        // Boundary between the last segment and segment 0 wraps to 0.
        assert_eq!(select_segment(POINTER_ANGLE, n), Some(0));
    }

    #[test]
    fn turn_settings_fall_back_tier_then_global() {
        let legacy: SpinSettings =
            serde_json::from_value(serde_json::json!({"duration": 20000, "turns": 12})).unwrap();
        assert_eq!(legacy.turns_for(Tier::Special, 15), 12);

        let mut settings = SpinSettings {
            turns: 0,
            ..SpinSettings::default()
        };
        settings.turns_by_tier[Tier::Special] = 30;
        assert_eq!(settings.turns_for(Tier::Special, 15), 30);
        assert_eq!(settings.turns_for(Tier::Third, 15), 15);
    }

    #[test]
    fn no_segment_on_empty_wheel() {
        assert_eq!(select_segment(1.0, 0), None);
    }

    #[test]
    fn lands_exactly_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut animator = SpinAnimator::new();
        let timing = SpinTiming {
            per_turn: Duration::from_millis(100),
            deceleration_turns: 2,
        };
        let t0 = Instant::now();
        let target = animator
            .start(t0, Slot::new(Tier::Consolation, 0), 15, wheel_segments(&pool(5)), &timing, &mut rng)
            .unwrap();

        assert!(target.rotation_end <= target.rotation_start - 15.0 * TAU);
        assert!(target.rotation_end > target.rotation_start - 16.0 * TAU);
        assert_eq!(target.duration, Duration::from_millis(1700));

        assert!(matches!(
            animator.advance(t0 + Duration::from_millis(850)),
            Advance::Spinning { .. }
        ));
        assert!(animator.is_spinning());

        let mut landings = 0;
        for ms in [1700u64, 1716, 1732, 5000] {
            if let Advance::Landed(landing) = animator.advance(t0 + Duration::from_millis(ms)) {
                landings += 1;
                assert_eq!(landing.rotation, target.rotation_end);
                assert_eq!(
                    landing.number,
                    target.segments[landing.segment].clone()
                );
            }
        }
        assert_eq!(landings, 1);
        assert!(!animator.is_spinning());
        assert_eq!(animator.rotation(), target.rotation_end);
    }

    #[test]
    fn refuses_second_spin_while_in_flight() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut animator = SpinAnimator::new();
        let slot = Slot::new(Tier::Special, 0);
        let t0 = Instant::now();
        animator
            .start(t0, slot, 3, wheel_segments(&pool(2)), &SpinTiming::default(), &mut rng)
            .unwrap();
        let err = animator
            .start(t0, slot, 3, wheel_segments(&pool(2)), &SpinTiming::default(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, SpinError::AlreadySpinning));
    }

    #[test]
    fn next_spin_starts_where_the_last_one_stopped() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut animator = SpinAnimator::new();
        let timing = SpinTiming {
            per_turn: Duration::from_millis(10),
            deceleration_turns: 0,
        };
        let t0 = Instant::now();
        let slot = Slot::new(Tier::First, 0);
        animator
            .start(t0, slot, 1, wheel_segments(&pool(2)), &timing, &mut rng)
            .unwrap();
        animator.advance(t0 + Duration::from_secs(1));
        let rest = animator.rotation();

        let second = animator
            .start(t0 + Duration::from_secs(1), slot, 1, wheel_segments(&pool(2)), &timing, &mut rng)
            .unwrap();
        assert_eq!(second.rotation_start, rest);
    }
}
