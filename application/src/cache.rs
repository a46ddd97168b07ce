//! Response cache for answered questions.
//!
//! Keys combine the technology, the normalized question, and any request
//! parameters, so equivalent questions hit the same entry regardless of
//! casing or stray whitespace. Expiry is lazy: an expired entry is evicted
//! when a `get` touches it, and a full sweep runs once per
//! [`CacheConfig::sweep_every`] insertions rather than on a timer.

use crate::config::CacheConfig;
use sage_domain::{Question, Technology};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry<T> {
    data: T,
    inserted_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    insertions: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counters exposed by [`ResponseCache::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// hits / (hits + misses), or 0.0 before any lookup.
    pub hit_rate: f64,
}

/// In-memory TTL cache keyed by technology and normalized question.
pub struct ResponseCache<T> {
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertions: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Builds the lookup key for a question.
    pub fn cache_key(
        technology: &Technology,
        question: &Question,
        params: Option<&Value>,
    ) -> String {
        format!(
            "{}|{}|{}",
            technology.key(),
            question.normalized(),
            params.map(Value::to_string).unwrap_or_default()
        )
    }

    /// Looks up a cached answer. Expired entries are evicted on touch and
    /// count as misses.
    pub fn get(
        &self,
        technology: &Technology,
        question: &Question,
        params: Option<&Value>,
    ) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let key = Self::cache_key(technology, question, params);
        let now = Instant::now();
        let mut state = self.lock_state();

        let expired = match state.entries.get(&key) {
            Some(entry) if !entry.is_expired(now) => {
                let data = entry.data.clone();
                state.hits += 1;
                return Some(data);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(&key);
            state.evictions += 1;
        }
        state.misses += 1;
        None
    }

    /// Stores an answer under the question's key. `ttl` falls back to the
    /// configured default.
    pub fn set(
        &self,
        technology: &Technology,
        question: &Question,
        params: Option<&Value>,
        data: T,
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }
        let key = Self::cache_key(technology, question, params);
        let mut state = self.lock_state();
        state.insertions += 1;
        if self.config.sweep_every > 0 && state.insertions % self.config.sweep_every == 0 {
            Self::sweep(&mut state);
        }
        state.entries.insert(
            key,
            CacheEntry {
                data,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.config.default_ttl),
            },
        );
    }

    /// Drops every entry. Counters survive.
    pub fn clear(&self) {
        self.lock_state().entries.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.lock_state();
        let lookups = state.hits + state.misses;
        CacheMetrics {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    fn sweep(state: &mut CacheState<T>) {
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        state.evictions += (before - state.entries.len()) as u64;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
