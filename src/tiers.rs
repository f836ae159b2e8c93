//! Prize tier model.
//!
//! Five fixed tiers, lowest value first. The same order is the draw priority:
//! consolation prizes are handed out before the special prize. Slot counts and
//! winner assignments live in the registry as objects keyed by the tier's
//! lowercase name:
//!
//! ```text
//! settings/prizeCounts  = { "consolation": 3, "third": 2, ..., "special": 1 }
//! settings/prizeWinners = { "consolation": ["12", null, null], ... }
//! ```

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use tracing::warn;

/// Highest slot index accepted from a sparse registry object.
pub const MAX_SPARSE_INDEX: usize = 9_999;

/// A prize category. Declaration order is the draw priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Consolation,
    Third,
    Second,
    First,
    Special,
}

impl Tier {
    /// All tiers in draw priority order (lowest value first).
    pub const ALL: [Tier; 5] = [
        Tier::Consolation,
        Tier::Third,
        Tier::Second,
        Tier::First,
        Tier::Special,
    ];

    /// Key used for this tier in registry documents.
    pub fn key(self) -> &'static str {
        match self {
            Tier::Consolation => "consolation",
            Tier::Third => "third",
            Tier::Second => "second",
            Tier::First => "first",
            Tier::Special => "special",
        }
    }

    /// Key written by the earlier console, still present in older databases.
    fn legacy_key(self) -> &'static str {
        match self {
            Tier::Consolation => "Giải khuyến khích",
            Tier::Third => "Giải ba",
            Tier::Second => "Giải nhì",
            Tier::First => "Giải nhất",
            Tier::Special => "Giải đặc biệt",
        }
    }

    fn position(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown prize tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        Tier::ALL
            .into_iter()
            .find(|tier| {
                tier.key().eq_ignore_ascii_case(key) || tier.legacy_key().eq_ignore_ascii_case(key)
            })
            .ok_or_else(|| UnknownTier(s.to_string()))
    }
}

/// One awardable position within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub tier: Tier,
    pub index: usize,
}

impl Slot {
    pub fn new(tier: Tier, index: usize) -> Self {
        Self { tier, index }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tier, self.index)
    }
}

/// A value per tier, serialized as an object keyed by [`Tier::key`].
///
/// Unknown keys are ignored on input and missing keys fall back to
/// `T::default()`, so a partially written registry node still decodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TierMap<T>([T; 5]);

impl<T> TierMap<T> {
    pub fn from_fn(mut f: impl FnMut(Tier) -> T) -> Self {
        Self(Tier::ALL.map(&mut f))
    }

    /// Entries in draw priority order.
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &T)> {
        Tier::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Tier> for TierMap<T> {
    type Output = T;

    fn index(&self, tier: Tier) -> &T {
        &self.0[tier.position()]
    }
}

impl<T> IndexMut<Tier> for TierMap<T> {
    fn index_mut(&mut self, tier: Tier) -> &mut T {
        &mut self.0[tier.position()]
    }
}

impl<T: Serialize> Serialize for TierMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Tier::ALL.len()))?;
        for (tier, value) in self.iter() {
            map.serialize_entry(tier.key(), value)?;
        }
        map.end()
    }
}

impl<'de, T: DeserializeOwned + Default> Deserialize<'de> for TierMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: HashMap<String, Option<T>> = HashMap::deserialize(deserializer)?;
        let mut map = TierMap::default();
        for (key, value) in raw {
            if let Ok(tier) = key.parse::<Tier>() {
                map[tier] = value.unwrap_or_default();
            }
        }
        Ok(map)
    }
}

/// Number of slots configured per tier.
pub type TierCounts = TierMap<u32>;

impl TierCounts {
    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// Winner assignments: per tier, one entry per slot, `None` while unfilled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct WinnerBoard(TierMap<Vec<Option<String>>>);

impl WinnerBoard {
    /// An all-empty board sized to `counts`.
    pub fn empty(counts: &TierCounts) -> Self {
        Self(TierMap::from_fn(|tier| vec![None; counts[tier] as usize]))
    }

    pub fn tier(&self, tier: Tier) -> &[Option<String>] {
        &self.0[tier]
    }

    /// Number held by `slot`, if it is filled.
    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.0[slot.tier]
            .get(slot.index)
            .and_then(|entry| entry.as_deref())
    }

    pub fn is_filled(&self, slot: Slot) -> bool {
        self.get(slot).is_some()
    }

    /// Write `number` into `slot`, growing the tier list if needed.
    pub fn fill(&mut self, slot: Slot, number: impl Into<String>) {
        let slots = &mut self.0[slot.tier];
        if slots.len() <= slot.index {
            slots.resize(slot.index + 1, None);
        }
        slots[slot.index] = Some(number.into());
    }

    /// Empty `slot`, returning the number it held.
    pub fn clear(&mut self, slot: Slot) -> Option<String> {
        self.0[slot.tier]
            .get_mut(slot.index)
            .and_then(|entry| entry.take())
    }

    /// Pad or truncate every tier to its configured count, keeping existing
    /// assignments in the slots that survive.
    pub fn reconcile(&mut self, counts: &TierCounts) {
        for tier in Tier::ALL {
            self.0[tier].resize(counts[tier] as usize, None);
        }
    }

    /// Every number currently holding a slot, in any tier.
    pub fn won_numbers(&self) -> HashSet<&str> {
        self.0
            .iter()
            .flat_map(|(_, slots)| slots.iter().filter_map(|entry| entry.as_deref()))
            .collect()
    }

    pub fn contains(&self, number: &str) -> bool {
        self.0
            .iter()
            .any(|(_, slots)| slots.iter().any(|entry| entry.as_deref() == Some(number)))
    }

    pub fn filled_count(&self) -> usize {
        self.won_numbers().len()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A tier's slot list as it may come back from the registry: a plain array
/// (possibly shorter than the count, trailing empties dropped) or an object
/// keyed by slot index when the array was sparse.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSlots {
    List(Vec<Option<RawNumber>>),
    Keyed(BTreeMap<String, Option<RawNumber>>),
}

impl Default for RawSlots {
    fn default() -> Self {
        RawSlots::List(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Text(String),
    Int(i64),
}

impl RawNumber {
    fn into_number(self) -> Option<String> {
        match self {
            RawNumber::Text(s) if s.trim().is_empty() => None,
            RawNumber::Text(s) => Some(s),
            RawNumber::Int(n) => Some(n.to_string()),
        }
    }
}

impl RawSlots {
    fn into_slots(self) -> Vec<Option<String>> {
        match self {
            RawSlots::List(list) => list
                .into_iter()
                .map(|entry| entry.and_then(RawNumber::into_number))
                .collect(),
            RawSlots::Keyed(keyed) => {
                let mut entries = BTreeMap::new();
                for (key, value) in keyed {
                    let Ok(index) = key.parse::<usize>() else {
                        continue;
                    };
                    if index > MAX_SPARSE_INDEX {
                        warn!(index = %key, "Ignoring out-of-range winner slot");
                        continue;
                    }
                    entries.insert(index, value.and_then(RawNumber::into_number));
                }
                let len = entries
                    .last_key_value()
                    .and_then(|(index, _)| index.checked_add(1))
                    .unwrap_or(0);
                let mut slots = vec![None; len];
                for (index, number) in entries {
                    slots[index] = number;
                }
                slots
            }
        }
    }
}

impl<'de> Deserialize<'de> for WinnerBoard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: HashMap<String, Option<RawSlots>> = HashMap::deserialize(deserializer)?;
        let mut board = TierMap::<Vec<Option<String>>>::default();
        for (key, value) in raw {
            if let Ok(tier) = key.parse::<Tier>() {
                board[tier] = value.unwrap_or_default().into_slots();
            }
        }
        Ok(WinnerBoard(board))
    }
}

/// Decode an optional registry snapshot, treating an absent node as default.
pub fn decode_or_default<T: DeserializeOwned + Default>(
    snapshot: Option<&serde_json::Value>,
) -> Result<T, serde_json::Error> {
    match snapshot {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => T::deserialize(value),
    }
}
