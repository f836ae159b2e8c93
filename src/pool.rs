//! Eligible pool: registrant numbers that have not won anything yet.
//!
//! The pool is never stored. It is recomputed from the registrant set and the
//! winner board whenever either changes, so there is exactly one source of
//! truth for who has won.

use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::tiers::WinnerBoard;

/// Order lucky numbers the way the wheel lists them by default: numerically
/// where they parse as integers, with anything else after them in text order.
pub fn compare_numbers(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Numbers from `all_numbers` that hold no slot in any tier, in default
/// wheel order. Winning is terminal: a number leaves the pool on its first
/// win and only returns through undo or reset.
pub fn eligible_pool<'a, I>(all_numbers: I, board: &WinnerBoard) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let won = board.won_numbers();
    let mut pool: Vec<String> = all_numbers
        .into_iter()
        .filter(|number| !won.contains(*number))
        .map(str::to_string)
        .collect();
    pool.sort_by(|a, b| compare_numbers(a, b));
    pool.dedup();
    pool
}

/// A uniformly random permutation of `pool` (Fisher-Yates). The input is
/// left untouched; only display order changes, never membership.
pub fn shuffle<R: Rng + ?Sized>(pool: &[String], rng: &mut R) -> Vec<String> {
    let mut shuffled = pool.to_vec();
    shuffled.shuffle(rng);
    shuffled
}

/// Lay out the current pool in a previously chosen display order.
///
/// Members that left the pool are dropped; members that joined since the
/// order was chosen are appended in default order. Membership always equals
/// `pool`.
pub fn arrange(pool: &[String], display_order: &[String]) -> Vec<String> {
    let members: HashSet<&str> = pool.iter().map(String::as_str).collect();
    let mut placed: HashSet<&str> = HashSet::with_capacity(pool.len());
    let mut arranged = Vec::with_capacity(pool.len());

    for number in display_order {
        if members.contains(number.as_str()) && placed.insert(number.as_str()) {
            arranged.push(number.clone());
        }
    }
    for number in pool {
        if placed.insert(number.as_str()) {
            arranged.push(number.clone());
        }
    }
    arranged
}
