use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};

/// Signals that drop every cache key registered for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// A user signed in.
    UserLogin,
    /// The user signed out.
    UserLogout,
    /// The subscription plan changed.
    SubscriptionChange,
    /// Profile data changed.
    ProfileUpdate,
    /// A payment went through.
    PaymentSuccess,
    /// The user asked for fresh data.
    ManualRefresh,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    created_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// A live entry copied out of a [`TtlCache`], with the time it has left.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedEntry<T> {
    /// Cache key.
    pub key: String,
    /// Stored value.
    pub value: T,
    /// Time to live left at export.
    pub remaining: Duration,
    /// Events the key is registered for, sorted.
    pub events: Vec<InvalidationEvent>,
}

#[derive(Debug)]
struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    subscriptions: HashMap<InvalidationEvent, HashSet<String>>,
    next_generation: u64,
    // Generation handed out by the last `clear` / `invalidate(event)`.
    // Writes reserved before these are stale.
    cleared_at: u64,
    invalidated_at: HashMap<InvalidationEvent, u64>,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.subscriptions.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
        removed
    }

    fn take_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn register(&mut self, key: &str, events: &[InvalidationEvent]) {
        for event in events {
            self.subscriptions
                .entry(*event)
                .or_default()
                .insert(key.to_string());
        }
    }

    fn insert_if_newer(&mut self, key: String, data: T, ttl: Duration, generation: u64) -> bool {
        if generation < self.cleared_at
            || self
                .entries
                .get(&key)
                .is_some_and(|existing| existing.generation > generation)
        {
            return false;
        }
        self.next_generation = self.next_generation.max(generation);
        self.entries.insert(
            key,
            CacheEntry {
                data,
                created_at: Instant::now(),
                ttl,
                generation,
            },
        );
        true
    }
}

/// Key/value store with per-entry TTL and event-driven invalidation.
///
/// All access goes through one mutex, so a read never races the sweeper.
#[derive(Debug)]
pub struct TtlCache<T> {
    inner: Mutex<CacheInner<T>>,
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TtlCache<T> {
    /// Empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                subscriptions: HashMap::new(),
                next_generation: 0,
                cleared_at: 0,
                invalidated_at: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`; an expired entry is evicted and reads as absent.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.lock();
        let entry = inner.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            inner.remove(key);
            return None;
        }
        Some(entry.data.clone())
    }

    /// Insert or overwrite `key`, restarting its TTL. Returns the entry's generation.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) -> u64 {
        let mut inner = self.lock();
        let generation = inner.take_generation();
        inner.entries.insert(
            key.into(),
            CacheEntry {
                data: value,
                created_at: Instant::now(),
                ttl,
                generation,
            },
        );
        generation
    }

    /// Reserve a generation number before starting a slow fetch.
    pub fn next_generation(&self) -> u64 {
        self.lock().take_generation()
    }

    /// Write `value` unless the entry already holds data from a later generation.
    pub fn set_if_newer(
        &self,
        key: impl Into<String>,
        value: T,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        self.lock().insert_if_newer(key.into(), value, ttl, generation)
    }

    /// [`TtlCache::set_if_newer`] plus [`TtlCache::register_for_invalidation`], as one step.
    ///
    /// Refused when any of `events` fired (or the cache was cleared) after
    /// `generation` was reserved, so a fetch that raced a logout cannot bring
    /// the old data back.
    pub fn set_registered(
        &self,
        key: impl Into<String>,
        value: T,
        ttl: Duration,
        generation: u64,
        events: &[InvalidationEvent],
    ) -> bool {
        let key = key.into();
        let mut inner = self.lock();
        let superseded = events.iter().any(|event| {
            inner
                .invalidated_at
                .get(event)
                .is_some_and(|&at| generation < at)
        });
        if superseded {
            tracing::debug!(key, generation, "stale write dropped after invalidation");
            return false;
        }
        if !inner.insert_if_newer(key.clone(), value, ttl, generation) {
            return false;
        }
        inner.register(&key, events);
        true
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    /// Remove every entry whose key matches `pred`.
    pub fn delete_where(&self, pred: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.lock();
        let keys: Vec<String> = inner.entries.keys().filter(|k| pred(k)).cloned().collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Drop all entries and registrations.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.subscriptions.clear();
        inner.cleared_at = inner.take_generation();
    }

    /// Drop `key` whenever any of `events` fires.
    pub fn register_for_invalidation(&self, key: &str, events: &[InvalidationEvent]) {
        self.lock().register(key, events);
    }

    /// Remove every key registered for `event`. Returns how many entries went away.
    ///
    /// [`TtlCache::set_registered`] refuses writes reserved before this call.
    pub fn invalidate(&self, event: InvalidationEvent) -> usize {
        let mut inner = self.lock();
        let stamp = inner.take_generation();
        inner.invalidated_at.insert(event, stamp);
        let Some(keys) = inner.subscriptions.remove(&event) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if inner.remove(&key) {
                removed += 1;
            }
        }
        tracing::debug!(?event, removed, "cache invalidated");
        removed
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Live entries whose key matches `pred`, sorted by key.
    pub fn export(&self, pred: impl Fn(&str) -> bool) -> Vec<ExportedEntry<T>> {
        let now = Instant::now();
        let inner = self.lock();
        let mut out: Vec<ExportedEntry<T>> = inner
            .entries
            .iter()
            .filter(|(key, entry)| pred(key) && !entry.is_expired(now))
            .map(|(key, entry)| {
                let age = now.saturating_duration_since(entry.created_at);
                let mut events: Vec<InvalidationEvent> = inner
                    .subscriptions
                    .iter()
                    .filter(|(_, keys)| keys.contains(key))
                    .map(|(event, _)| *event)
                    .collect();
                events.sort();
                ExportedEntry {
                    key: key.clone(),
                    value: entry.data.clone(),
                    remaining: entry.ttl.saturating_sub(age),
                    events,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Insert exported entries, each with a fresh generation and its remaining TTL.
    ///
    /// Entries with no time left are skipped. Returns how many were inserted.
    pub fn import(&self, entries: impl IntoIterator<Item = ExportedEntry<T>>) -> usize {
        let mut inner = self.lock();
        let mut imported = 0;
        for entry in entries {
            if entry.remaining.is_zero() {
                continue;
            }
            let generation = inner.take_generation();
            if inner.insert_if_newer(entry.key.clone(), entry.value, entry.remaining, generation) {
                inner.register(&entry.key, &entry.events);
                imported += 1;
            }
        }
        imported
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> TtlCache<T> {
    /// Run [`TtlCache::sweep_expired`] every `every` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let swept = cache.sweep_expired();
                if swept > 0 {
                    tracing::debug!(swept, "expired cache entries removed");
                }
            }
        })
    }
}
