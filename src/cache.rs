// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local patient replica, maintained from the event stream.
//!
//! The cache is a denormalized copy of patient data owned by another
//! service. It is eventually consistent: updates arrive as events and are
//! merged last-writer-wins by *producer event time*, so redelivered or
//! reordered events converge to the same state regardless of arrival
//! order.
//!
//! Reads never block on freshness. An entry that has not been refreshed
//! within the configured threshold is still returned, tagged stale, so
//! callers can degrade presentation instead of failing.
//!
//! The map is sharded by key hash; writers on different patients do not
//! contend on a single lock.

use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::event::PatientEvent;
use crate::metrics;

/// One patient's replicated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPatient {
    pub patient_id: String,
    pub full_name: String,
    pub email: String,
    /// Producer event time of the newest applied update, ms since epoch.
    /// Drives the last-writer-wins merge.
    pub updated_at_ms: i64,
    /// Local wall-clock time the update was applied. Drives staleness.
    pub applied_at: DateTime<Utc>,
}

/// A read result: the replicated value plus its freshness verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheView {
    pub patient_id: String,
    pub full_name: String,
    pub email: String,
    pub updated_at_ms: i64,
    /// True when the entry outlived the freshness threshold without a
    /// refresh. The value is still served.
    pub stale: bool,
}

/// Sharded, event-maintained patient replica.
pub struct PatientCache {
    shards: Vec<RwLock<HashMap<String, CachedPatient>>>,
    freshness_threshold: Duration,
}

impl PatientCache {
    /// Create a cache with the given staleness threshold and shard count.
    pub fn new(freshness_threshold: Duration, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            freshness_threshold,
        }
    }

    fn shard_for(&self, patient_id: &str) -> &RwLock<HashMap<String, CachedPatient>> {
        let mut hasher = DefaultHasher::new();
        patient_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Merge one patient event into the replica.
    ///
    /// Returns `true` if the event was applied, `false` if it was skipped
    /// because a newer update (by event time) is already present. Equal
    /// event times apply, so redelivery of the newest event is a no-op
    /// in value terms and refreshes the staleness clock.
    pub fn apply(&self, event: &PatientEvent) -> bool {
        let shard = self.shard_for(&event.patient_id);
        let mut map = shard.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = map.get(&event.patient_id) {
            if event.occurred_at_ms < existing.updated_at_ms {
                debug!(
                    patient_id = %event.patient_id,
                    event_ts = event.occurred_at_ms,
                    current_ts = existing.updated_at_ms,
                    "Skipping out-of-order patient event"
                );
                metrics::record_cache_skip();
                return false;
            }
        }

        map.insert(
            event.patient_id.clone(),
            CachedPatient {
                patient_id: event.patient_id.clone(),
                full_name: event.name.clone(),
                email: event.email.clone(),
                updated_at_ms: event.occurred_at_ms,
                applied_at: Utc::now(),
            },
        );
        metrics::record_cache_apply();
        true
    }

    /// Look up a patient, tagging the result with its freshness verdict.
    pub fn get(&self, patient_id: &str) -> Option<CacheView> {
        let shard = self.shard_for(patient_id);
        let map = shard.read().unwrap_or_else(|e| e.into_inner());
        let view = map.get(patient_id).map(|entry| self.view_of(entry));
        match &view {
            Some(v) if v.stale => metrics::record_cache_read("stale"),
            Some(_) => metrics::record_cache_read("hit"),
            None => metrics::record_cache_read("miss"),
        }
        view
    }

    /// Raw replicated record, without a freshness verdict.
    pub fn entry(&self, patient_id: &str) -> Option<CachedPatient> {
        let shard = self.shard_for(patient_id);
        let map = shard.read().unwrap_or_else(|e| e.into_inner());
        map.get(patient_id).cloned()
    }

    /// Display name for a patient, `"Unknown"` when the replica has no
    /// entry. Used by read paths that must render something either way.
    pub fn display_name(&self, patient_id: &str) -> String {
        self.get(patient_id)
            .map(|view| view.full_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Number of cached patients across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn view_of(&self, entry: &CachedPatient) -> CacheView {
        let age = Utc::now()
            .signed_duration_since(entry.applied_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        CacheView {
            patient_id: entry.patient_id.clone(),
            full_name: entry.full_name.clone(),
            email: entry.email.clone(),
            updated_at_ms: entry.updated_at_ms,
            stale: age > self.freshness_threshold,
        }
    }

    /// Insert an entry with an explicit applied-at time, for staleness tests.
    #[cfg(test)]
    fn insert_applied_at(&self, event: &PatientEvent, applied_at: DateTime<Utc>) {
        let shard = self.shard_for(&event.patient_id);
        let mut map = shard.write().unwrap_or_else(|e| e.into_inner());
        map.insert(
            event.patient_id.clone(),
            CachedPatient {
                patient_id: event.patient_id.clone(),
                full_name: event.name.clone(),
                email: event.email.clone(),
                updated_at_ms: event.occurred_at_ms,
                applied_at,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PatientEvent;

    fn cache() -> PatientCache {
        PatientCache::new(Duration::from_secs(300), 16)
    }

    #[test]
    fn test_miss_returns_none_and_unknown() {
        let c = cache();
        assert!(c.get("nope").is_none());
        assert_eq!(c.display_name("nope"), "Unknown");
    }

    #[test]
    fn test_apply_then_get() {
        let c = cache();
        let applied = c.apply(&PatientEvent::created("p-1", "Alice", "alice@example.com", 100));
        assert!(applied);

        let view = c.get("p-1").unwrap();
        assert_eq!(view.full_name, "Alice");
        assert_eq!(view.email, "alice@example.com");
        assert_eq!(view.updated_at_ms, 100);
        assert!(!view.stale);
        assert_eq!(c.display_name("p-1"), "Alice");
    }

    #[test]
    fn test_out_of_order_update_skipped() {
        let c = cache();
        c.apply(&PatientEvent::updated("p-1", "Alice", "alice@example.com", 100));

        // An older rename arrives late; the newer value must win.
        let applied = c.apply(&PatientEvent::updated("p-1", "Alicia", "alice@example.com", 90));
        assert!(!applied);
        assert_eq!(c.get("p-1").unwrap().full_name, "Alice");
        assert_eq!(c.get("p-1").unwrap().updated_at_ms, 100);
    }

    #[test]
    fn test_newer_update_wins() {
        let c = cache();
        c.apply(&PatientEvent::created("p-1", "Alice", "alice@example.com", 100));
        assert!(c.apply(&PatientEvent::updated("p-1", "Alicia", "alicia@example.com", 110)));
        assert_eq!(c.get("p-1").unwrap().full_name, "Alicia");
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let c = cache();
        let event = PatientEvent::created("p-1", "Alice", "alice@example.com", 100);
        c.apply(&event);
        let before = c.get("p-1").unwrap();

        assert!(c.apply(&event));
        let after = c.get("p-1").unwrap();
        assert_eq!(before.full_name, after.full_name);
        assert_eq!(before.updated_at_ms, after.updated_at_ms);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let events = [
            PatientEvent::created("p-1", "Alice", "a1@example.com", 100),
            PatientEvent::updated("p-1", "Alicia", "a2@example.com", 200),
            PatientEvent::updated("p-1", "Alyce", "a3@example.com", 150),
        ];

        let forward = cache();
        for e in &events {
            forward.apply(e);
        }

        let reversed = cache();
        for e in events.iter().rev() {
            reversed.apply(e);
        }

        assert_eq!(
            forward.get("p-1").unwrap().full_name,
            reversed.get("p-1").unwrap().full_name
        );
        assert_eq!(forward.get("p-1").unwrap().full_name, "Alicia");
    }

    #[test]
    fn test_stale_entry_still_served() {
        let c = PatientCache::new(Duration::from_secs(300), 4);
        let event = PatientEvent::created("p-1", "Alice", "alice@example.com", 100);
        c.insert_applied_at(&event, Utc::now() - chrono::Duration::seconds(600));

        let view = c.get("p-1").unwrap();
        assert!(view.stale);
        assert_eq!(view.full_name, "Alice");
    }

    #[test]
    fn test_refresh_clears_staleness() {
        let c = PatientCache::new(Duration::from_secs(300), 4);
        let old = PatientEvent::created("p-1", "Alice", "alice@example.com", 100);
        c.insert_applied_at(&old, Utc::now() - chrono::Duration::seconds(600));
        assert!(c.get("p-1").unwrap().stale);

        c.apply(&PatientEvent::updated("p-1", "Alice", "alice@example.com", 200));
        assert!(!c.get("p-1").unwrap().stale);
    }

    #[test]
    fn test_single_shard_still_works() {
        let c = PatientCache::new(Duration::from_secs(300), 0);
        c.apply(&PatientEvent::created("p-1", "Alice", "a@example.com", 1));
        c.apply(&PatientEvent::created("p-2", "Bob", "b@example.com", 1));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_keys_spread_across_shards() {
        let c = cache();
        for i in 0..100 {
            c.apply(&PatientEvent::created(
                format!("p-{}", i),
                "X",
                "x@example.com",
                1,
            ));
        }
        assert_eq!(c.len(), 100);
    }
}
