//! Registrants and the participant roster.
//!
//! A registrant is keyed by their lucky number; the stored record is
//! `registration/{number} = { "email": "...", "timestamp": <ms> }`. Numbers
//! and e-mail addresses are each unique. While the participant list is
//! locked nobody can join or be removed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::pool::compare_numbers;
use crate::registry::{paths, Registry, RegistryError, Snapshot};

/// Conditional writes attempted before a registration gives up.
const REGISTER_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registrant {
    pub number: String,
    pub email: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRegistration {
    email: String,
    #[serde(default)]
    timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("lucky number {0} is already taken")]
    NumberTaken(String),
    #[error("email {0} is already registered")]
    EmailTaken(String),
    #[error("no registrant holds lucky number {0}")]
    NotFound(String),
    #[error("the participant list is locked")]
    Locked,
    #[error("registration kept conflicting after {0} attempts")]
    Contended(u32),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Decode the `registration` node. Malformed entries are skipped.
///
/// Small integer keys may come back from the registry as an array indexed by
/// number; both shapes are accepted.
pub fn decode_registrants(snapshot: Option<&Value>) -> BTreeMap<String, Registrant> {
    let entries: Vec<(String, &Value)> = match snapshot {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|(number, value)| {
            match StoredRegistration::deserialize(value) {
                Ok(stored) => Some((
                    number.clone(),
                    Registrant {
                        number,
                        email: stored.email.to_lowercase(),
                        timestamp: stored.timestamp,
                    },
                )),
                Err(e) => {
                    warn!(number = %number, error = %e, "Skipping malformed registration");
                    None
                }
            }
        })
        .collect()
}

/// Decode the invited e-mail list, stored either as an array or as an object
/// of push-id keys.
pub fn decode_invited(snapshot: Option<&Value>) -> Vec<String> {
    let values: Vec<&Value> = match snapshot {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => map.values().collect(),
        _ => return Vec::new(),
    };
    values
        .into_iter()
        .filter_map(Value::as_str)
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
        .collect()
}

pub async fn is_locked(registry: &dyn Registry) -> Result<bool, RegistryError> {
    Ok(registry
        .get(paths::LOCKED)
        .await?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

pub async fn set_locked(registry: &dyn Registry, locked: bool) -> Result<(), RegistryError> {
    registry.set(paths::LOCKED, Value::Bool(locked)).await?;
    info!(locked, "Participant list lock updated");
    Ok(())
}

/// Register `email` under `number`.
///
/// Both inputs are trimmed and the e-mail lowercased before the uniqueness
/// checks. The checks run against a fresh read of the whole `registration`
/// node, which is then replaced conditionally; a concurrent change sends the
/// registration back to re-check.
pub async fn register(
    registry: &dyn Registry,
    email: &str,
    number: &str,
    now_ms: i64,
) -> Result<Registrant, RegistrationError> {
    let email = email.trim().to_lowercase();
    let number = number.trim().to_string();
    if email.is_empty() {
        return Err(RegistrationError::Missing("email"));
    }
    if number.is_empty() {
        return Err(RegistrationError::Missing("lucky number"));
    }
    if !matches!(crate::registry::segments(&number), Ok(parts) if parts.len() == 1) {
        return Err(RegistryError::InvalidPath(number).into());
    }

    if is_locked(registry).await? {
        return Err(RegistrationError::Locked);
    }

    let stored = serde_json::to_value(StoredRegistration {
        email: email.clone(),
        timestamp: now_ms,
    })
    .map_err(RegistryError::from)?;

    for attempt in 1..=REGISTER_ATTEMPTS {
        let snapshot = registry.get(paths::REGISTRATIONS).await?;
        let existing = decode_registrants(snapshot.as_ref());
        if existing.contains_key(&number) {
            return Err(RegistrationError::NumberTaken(number));
        }
        if existing.values().any(|r| r.email == email) {
            return Err(RegistrationError::EmailTaken(email));
        }

        let mut updated = registration_object(&snapshot);
        updated.insert(number.clone(), stored.clone());
        if registry
            .compare_and_set(paths::REGISTRATIONS, &snapshot, Value::Object(updated))
            .await?
        {
            info!(number = %number, email = %email, "Registered participant");
            return Ok(Registrant {
                number,
                email,
                timestamp: now_ms,
            });
        }
        warn!(number = %number, attempt, "Registration list changed underneath; retrying");
    }
    Err(RegistrationError::Contended(REGISTER_ATTEMPTS))
}

/// The `registration` node as an object keyed by number, whichever shape
/// it was stored in.
fn registration_object(snapshot: &Snapshot) -> serde_json::Map<String, Value> {
    match snapshot {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => serde_json::Map::new(),
    }
}

/// Remove a registrant. Any slot they hold is left as is; undo frees it.
pub async fn delete(registry: &dyn Registry, number: &str) -> Result<(), RegistrationError> {
    if is_locked(registry).await? {
        return Err(RegistrationError::Locked);
    }
    let path = paths::registrant(number);
    if registry.get(&path).await?.is_none() {
        return Err(RegistrationError::NotFound(number.to_string()));
    }
    registry.remove(&path).await?;
    info!(number, "Deleted participant");
    Ok(())
}

/// An invited address joined with its registration, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub email: String,
    pub number: Option<String>,
    pub timestamp: Option<i64>,
}

impl Participant {
    pub fn is_registered(&self) -> bool {
        self.number.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterOrder {
    Number,
    Email,
    #[default]
    Timestamp,
}

/// Join the invited list with registrations (case-insensitive on e-mail) and
/// sort: registered participants by `order`, then invitees who have not
/// registered, in invitation order.
pub fn roster(
    invited: &[String],
    registrants: &BTreeMap<String, Registrant>,
    order: RosterOrder,
) -> Vec<Participant> {
    let by_email: HashMap<String, &Registrant> = registrants
        .values()
        .map(|r| (r.email.to_lowercase(), r))
        .collect();

    let (mut registered, pending): (Vec<Participant>, Vec<Participant>) = invited
        .iter()
        .map(|email| {
            let found = by_email.get(&email.to_lowercase());
            Participant {
                email: email.clone(),
                number: found.map(|r| r.number.clone()),
                timestamp: found.map(|r| r.timestamp),
            }
        })
        .partition(Participant::is_registered);

    registered.sort_by(|a, b| match order {
        RosterOrder::Number => compare_numbers(
            a.number.as_deref().unwrap_or_default(),
            b.number.as_deref().unwrap_or_default(),
        ),
        RosterOrder::Email => a.email.cmp(&b.email),
        RosterOrder::Timestamp => a.timestamp.cmp(&b.timestamp),
    });

    registered.extend(pending);
    registered
}
