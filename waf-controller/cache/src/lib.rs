#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! In-memory, versioned storage for compiled WAF rulesets.
//!
//! The cache maps a ruleset key (the `namespace/name` of a RuleSet resource)
//! to an ordered history of rule blobs. Every write appends a new version
//! with a fresh identifier; the data plane polls the serving endpoints and
//! reloads when the latest identifier changes. Garbage collection trims old
//! versions by age and total size but never removes the latest version of a
//! key.

mod server;
mod sweep;


pub use self::server::{serve, MAX_HEADER_SIZE};
pub use self::sweep::{sweep, GcConfig};

use std::{collections::hash_map::Entry, sync::Arc, time::Duration};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use uuid::Uuid;

pub type SharedRuleSetCache = Arc<RuleSetCache>;

/// A cached ruleset version. Immutable once inserted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuleSetEntry {
    /// Opaque version identifier; clients detect change by inequality.
    pub uuid: String,

    #[serde(serialize_with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,

    pub rules: String,
}

fn rfc3339_nanos<S: Serializer>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Version history for a single key, ordered oldest to newest. Exactly one
/// entry carries the latest identifier and it is never pruned.
#[derive(Debug)]
struct VersionHistory {
    latest: String,
    entries: Vec<RuleSetEntry>,
}

#[derive(Debug, Default)]
struct Store {
    histories: HashMap<String, VersionHistory>,

    // Keys in first-put order; size pruning walks this so its tie-breaking
    // is deterministic for a given insertion order.
    insertion_order: Vec<String>,
}

/// Thread-safe, versioned storage for rulesets.
///
/// A single instance is constructed at process start and shared by the
/// RuleSet reconciler (writer) and the cache server (reader).
#[derive(Debug, Default)]
pub struct RuleSetCache {
    store: RwLock<Store>,
}

impl RuleSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRuleSetCache {
        Arc::new(Self::new())
    }

    /// Stores rules under the given key with a fresh version identifier and
    /// the current wall-clock timestamp. Identical blobs are not deduplicated;
    /// every put produces a new version.
    pub fn put(&self, key: impl Into<String>, rules: impl Into<String>) {
        let key = key.into();
        let entry = RuleSetEntry {
            uuid: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            rules: rules.into(),
        };

        let mut store = self.store.write();
        let Store {
            histories,
            insertion_order,
        } = &mut *store;
        match histories.entry(key) {
            Entry::Occupied(mut occupied) => {
                let history = occupied.get_mut();
                history.latest = entry.uuid.clone();
                history.entries.push(entry);
            }
            Entry::Vacant(vacant) => {
                insertion_order.push(vacant.key().clone());
                vacant.insert(VersionHistory {
                    latest: entry.uuid.clone(),
                    entries: vec![entry],
                });
            }
        }
    }

    /// Returns the latest entry for the given key.
    pub fn get(&self, key: &str) -> Option<RuleSetEntry> {
        let store = self.store.read();
        let history = store.histories.get(key)?;
        history
            .entries
            .iter()
            .find(|entry| entry.uuid == history.latest)
            .cloned()
    }

    /// All keys currently present. Order undefined.
    pub fn list_keys(&self) -> Vec<String> {
        self.store.read().histories.keys().cloned().collect()
    }

    /// Total size of all cached rules in bytes, across all versions of all
    /// keys. Counts rule bytes only; identifiers and timestamps are excluded,
    /// so the true memory footprint is strictly larger.
    pub fn total_size(&self) -> usize {
        self.store
            .read()
            .histories
            .values()
            .flat_map(|history| &history.entries)
            .map(|entry| entry.rules.len())
            .sum()
    }

    /// Number of versions held for the given key.
    pub fn count_entries(&self, key: &str) -> usize {
        self.store
            .read()
            .histories
            .get(key)
            .map(|history| history.entries.len())
            .unwrap_or(0)
    }

    /// Rewrites the timestamp of the entry at `index` (oldest first) for the
    /// given key. Test hook for exercising age-based pruning.
    pub fn set_entry_timestamp(&self, key: &str, index: usize, timestamp: DateTime<Utc>) {
        let mut store = self.store.write();
        if let Some(entry) = store
            .histories
            .get_mut(key)
            .and_then(|history| history.entries.get_mut(index))
        {
            entry.timestamp = timestamp;
        }
    }

    /// Removes entries older than `max_age`, never touching the latest entry
    /// of any key. Returns the number of entries removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut pruned = 0;

        let mut store = self.store.write();
        for history in store.histories.values_mut() {
            let latest = history.latest.clone();
            history.entries.retain(|entry| {
                if entry.uuid == latest {
                    return true;
                }
                let stale = now
                    .signed_duration_since(entry.timestamp)
                    .to_std()
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if stale {
                    pruned += 1;
                }
                !stale
            });
        }

        pruned
    }

    /// Removes the oldest non-latest entries until the total size is at most
    /// `max_size`, walking keys in insertion order. The latest entry of every
    /// key is retained unconditionally, so the cache may remain over the
    /// limit when the latest entries alone exceed it. Returns the number of
    /// entries removed.
    pub fn prune_by_size(&self, max_size: usize) -> usize {
        let mut store = self.store.write();

        let mut current: usize = store
            .histories
            .values()
            .flat_map(|history| &history.entries)
            .map(|entry| entry.rules.len())
            .sum();
        if current <= max_size {
            return 0;
        }

        let mut pruned = 0;
        let order = store.insertion_order.clone();
        for key in &order {
            if current <= max_size {
                break;
            }
            let Some(history) = store.histories.get_mut(key) else {
                continue;
            };
            let latest = history.latest.clone();
            history.entries.retain(|entry| {
                if entry.uuid == latest {
                    return true;
                }
                if current > max_size {
                    current -= entry.rules.len();
                    pruned += 1;
                    return false;
                }
                true
            });
        }

        pruned
    }
}
