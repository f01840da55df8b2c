//! TTL-bounded display-name cache.
//!
//! The cache is an owned value: the resolver constructs it from the durable
//! snapshot once at startup and hands snapshots back to the persister.
//! Expiry is enforced when reading and loading; the only explicit removal of
//! expired entries happens in [`ResolutionCache::snapshot`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::identity::ResolutionKey;

/// Default entry lifetime (12 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(ts.as_millis()).unwrap_or(u64::MAX)
}

/// A resolved display name and when it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    /// Epoch milliseconds.
    pub resolved_at: u64,
}

impl CacheEntry {
    /// Valid iff `now - resolved_at <= ttl`.
    #[must_use]
    pub fn is_fresh(&self, now_ms: u64, ttl: Duration) -> bool {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_sub(self.resolved_at) <= ttl_ms
    }
}

/// Persisted form of one entry: `{ "name": ..., "ts": <epoch ms> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub name: String,
    pub ts: u64,
}

/// Counters from loading a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub admitted: usize,
    pub expired: usize,
    pub malformed: usize,
}

/// Identity key → display name, with TTL.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    entries: HashMap<ResolutionKey, CacheEntry>,
    ttl: Duration,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResolutionCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Build a cache from a persisted snapshot, admitting only well-formed
    /// entries that are still within TTL.
    #[must_use]
    pub fn from_snapshot(snapshot: &Value, ttl: Duration, now_ms: u64) -> (Self, LoadReport) {
        let mut cache = Self::new(ttl);
        let mut report = LoadReport::default();

        let Some(map) = snapshot.as_object() else {
            debug!("cache snapshot is not an object; starting empty");
            return (cache, report);
        };

        for (raw_key, raw_entry) in map {
            let Some((key, entry)) = parse_entry(raw_key, raw_entry) else {
                report.malformed += 1;
                continue;
            };
            if entry.is_fresh(now_ms, ttl) {
                cache.entries.insert(key, entry);
                report.admitted += 1;
            } else {
                report.expired += 1;
            }
        }

        debug!(
            admitted = report.admitted,
            expired = report.expired,
            malformed = report.malformed,
            "cache snapshot loaded"
        );
        (cache, report)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh entry for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &ResolutionKey, now_ms: u64) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(now_ms, self.ttl))
    }

    /// Store a newly resolved name, replacing any previous entry wholesale.
    pub fn insert(&mut self, key: ResolutionKey, name: impl Into<String>, now_ms: u64) {
        self.entries.insert(
            key,
            CacheEntry {
                name: name.into(),
                resolved_at: now_ms,
            },
        );
    }

    /// Iterate entries in key order, including stale ones.
    pub fn iter(&self) -> impl Iterator<Item = (&ResolutionKey, &CacheEntry)> {
        let mut items: Vec<_> = self.entries.iter().collect();
        items.sort_by(|a, b| a.0.cmp(b.0));
        items.into_iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop expired entries and return the persisted form of the rest.
    pub fn snapshot(&mut self, now_ms: u64) -> Value {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.is_fresh(now_ms, ttl));

        let persisted: BTreeMap<&str, PersistedEntry> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.as_str(),
                    PersistedEntry {
                        name: entry.name.clone(),
                        ts: entry.resolved_at,
                    },
                )
            })
            .collect();
        serde_json::to_value(persisted).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

fn parse_entry(raw_key: &str, raw_entry: &Value) -> Option<(ResolutionKey, CacheEntry)> {
    let key = ResolutionKey::parse(raw_key)?;
    let persisted: PersistedEntry = serde_json::from_value(raw_entry.clone()).ok()?;
    if persisted.name.trim().is_empty() || persisted.ts == 0 {
        return None;
    }
    Some((
        key,
        CacheEntry {
            name: persisted.name,
            resolved_at: persisted.ts,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    fn ttl_ms() -> u64 {
        DEFAULT_TTL.as_millis() as u64
    }

    fn key(handle: &str) -> ResolutionKey {
        Identity::Handle(handle.into()).key()
    }

    #[test]
    fn load_respects_ttl_boundary() {
        let snapshot = json!({
            "h:stale": { "name": "Stale", "ts": NOW - ttl_ms() - 1 },
            "h:edge": { "name": "Edge", "ts": NOW - ttl_ms() },
            "h:fresh": { "name": "Fresh", "ts": NOW - 1 },
        });
        let (cache, report) = ResolutionCache::from_snapshot(&snapshot, DEFAULT_TTL, NOW);

        assert!(cache.get(&key("stale"), NOW).is_none());
        assert_eq!(cache.get(&key("edge"), NOW).unwrap().name, "Edge");
        assert_eq!(cache.get(&key("fresh"), NOW).unwrap().name, "Fresh");
        assert_eq!(
            report,
            LoadReport {
                admitted: 2,
                expired: 1,
                malformed: 0
            }
        );
    }

    #[test]
    fn load_drops_malformed_entries() {
        let snapshot = json!({
            "h:ok": { "name": "Ok", "ts": NOW },
            "h:noname": { "ts": NOW },
            "h:blank": { "name": "  ", "ts": NOW },
            "h:zero": { "name": "Zero", "ts": 0 },
            "h:strts": { "name": "Str", "ts": "yesterday" },
            "bogus": { "name": "Bogus", "ts": NOW },
            "c:UC1": "not an object",
        });
        let (cache, report) = ResolutionCache::from_snapshot(&snapshot, DEFAULT_TTL, NOW);
        assert_eq!(cache.len(), 1);
        assert_eq!(report.malformed, 6);
    }

    #[test]
    fn load_of_non_object_is_empty() {
        let (cache, report) = ResolutionCache::from_snapshot(&json!([1, 2]), DEFAULT_TTL, NOW);
        assert!(cache.is_empty());
        assert_eq!(report, LoadReport::default());
    }

    #[test]
    fn get_hides_expired_entries() {
        let mut cache = ResolutionCache::default();
        cache.insert(key("a"), "A", NOW);
        assert!(cache.get(&key("a"), NOW + ttl_ms()).is_some());
        assert!(cache.get(&key("a"), NOW + ttl_ms() + 1).is_none());
        // Still present until a snapshot prunes it.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_replaces_wholesale() {
        let mut cache = ResolutionCache::default();
        cache.insert(key("a"), "Old", NOW);
        cache.insert(key("a"), "New", NOW + 5);
        let entry = cache.get(&key("a"), NOW + 5).unwrap();
        assert_eq!(entry.name, "New");
        assert_eq!(entry.resolved_at, NOW + 5);
    }

    #[test]
    fn snapshot_prunes_expired_and_uses_wire_shape() {
        let mut cache = ResolutionCache::default();
        cache.insert(key("old"), "Old", NOW - ttl_ms() - 10);
        cache.insert(Identity::ChannelId("UCx".into()).key(), "Chan", NOW);

        let value = cache.snapshot(NOW);
        assert_eq!(value, json!({ "c:UCx": { "name": "Chan", "ts": NOW } }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_load() {
        let mut cache = ResolutionCache::default();
        cache.insert(key("a"), "A", NOW);
        let value = cache.snapshot(NOW);
        let (loaded, _) = ResolutionCache::from_snapshot(&value, DEFAULT_TTL, NOW);
        assert_eq!(loaded.get(&key("a"), NOW).unwrap().name, "A");
    }
}
