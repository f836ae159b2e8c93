//! Next-slot selection.

use crate::tiers::{Slot, Tier, TierCounts, WinnerBoard};

/// Find the next unfilled slot in draw priority order.
///
/// Tiers are walked lowest value first; within a tier the lowest unfilled
/// index wins. Only indices below the tier's configured count are considered,
/// so a board that lags behind a count change never yields a phantom slot.
/// Returns `None` once every configured slot is filled.
pub fn next_slot(counts: &TierCounts, board: &WinnerBoard) -> Option<Slot> {
    Tier::ALL.into_iter().find_map(|tier| {
        (0..counts[tier] as usize)
            .map(|index| Slot::new(tier, index))
            .find(|slot| !board.is_filled(*slot))
    })
}
