//! Warm-session reuse between questions.
//!
//! A finished session still holds its conversation context inside the
//! agent instance, so a follow-up question on the same technology can skip
//! session creation entirely. Sessions are only reusable within a window
//! of their last use and only on the instance that hosts them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// A session parked for reuse.
#[derive(Debug, Clone)]
pub struct PooledSession {
    pub session_id: String,
    /// Canonical technology key.
    pub technology: String,
    /// Instance hosting the session. Reuse requires acquiring this exact
    /// instance again.
    pub instance_id: u64,
    pub created_at: Instant,
    pub last_used: Instant,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionPoolMetrics {
    pub pooled_sessions: usize,
    pub offered_total: u64,
    pub reused_total: u64,
    pub expired_total: u64,
}

#[derive(Default)]
struct SessionPoolState {
    by_tech: HashMap<String, Vec<PooledSession>>,
    offered_total: u64,
    reused_total: u64,
    expired_total: u64,
}

pub struct SessionPool {
    reuse_window: Duration,
    state: Mutex<SessionPoolState>,
}

impl SessionPool {
    pub fn new(reuse_window: Duration) -> Self {
        Self {
            reuse_window,
            state: Mutex::new(SessionPoolState::default()),
        }
    }

    /// Parks a session for later reuse, replacing any previous entry with
    /// the same id.
    pub fn offer(&self, session: PooledSession) {
        let mut st = self.lock();
        for list in st.by_tech.values_mut() {
            list.retain(|s| s.session_id != session.session_id);
        }
        st.offered_total += 1;
        debug!(
            session = %session.session_id,
            technology = %session.technology,
            "session parked for reuse"
        );
        st.by_tech
            .entry(session.technology.clone())
            .or_default()
            .push(session);
    }

    /// Takes a reusable session for `technology` hosted on `instance_id`.
    /// Entries that went inactive or fell outside the reuse window are
    /// dropped on the way.
    pub fn checkout(&self, technology: &str, instance_id: u64) -> Option<PooledSession> {
        let now = Instant::now();
        let mut guard = self.lock();
        let SessionPoolState {
            by_tech,
            reused_total,
            expired_total,
            ..
        } = &mut *guard;

        let list = by_tech.get_mut(technology)?;
        let mut expired = 0u64;
        list.retain(|s| {
            if !s.is_active {
                return false;
            }
            let fresh = now.duration_since(s.last_used) < self.reuse_window;
            if !fresh {
                expired += 1;
            }
            fresh
        });
        *expired_total += expired;

        let idx = list.iter().position(|s| s.instance_id == instance_id)?;
        let mut session = list.remove(idx);
        session.last_used = now;
        *reused_total += 1;
        debug!(session = %session.session_id, "reusing parked session");
        Some(session)
    }

    /// Flags a parked session as no longer reusable. The entry stays put
    /// until the next checkout scan prunes it. Returns whether an entry
    /// was found.
    pub fn mark_inactive(&self, session_id: &str) -> bool {
        let mut st = self.lock();
        let mut found = false;
        for list in st.by_tech.values_mut() {
            for s in list.iter_mut().filter(|s| s.session_id == session_id) {
                s.is_active = false;
                found = true;
            }
        }
        found
    }

    /// Drops a session from the pool outright. Returns whether an entry
    /// was present.
    pub fn remove(&self, session_id: &str) -> bool {
        let mut st = self.lock();
        let mut removed = false;
        for list in st.by_tech.values_mut() {
            let before = list.len();
            list.retain(|s| s.session_id != session_id);
            removed |= list.len() < before;
        }
        removed
    }

    /// Drops every parked session.
    pub fn clear(&self) {
        self.lock().by_tech.clear();
    }

    pub fn metrics(&self) -> SessionPoolMetrics {
        let st = self.lock();
        SessionPoolMetrics {
            pooled_sessions: st.by_tech.values().map(Vec::len).sum(),
            offered_total: st.offered_total,
            reused_total: st.reused_total,
            expired_total: st.expired_total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionPoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn session(id: &str, technology: &str, instance_id: u64) -> PooledSession {
        let now = Instant::now();
        PooledSession {
            session_id: id.to_string(),
            technology: technology.to_string(),
            instance_id,
            created_at: now,
            last_used: now,
            is_active: true,
        }
    }

    #[test]
    fn test_reuse_within_window() {
        let pool = SessionPool::new(Duration::from_secs(60));
        pool.offer(session("s-1", "react", 7));

        let got = pool.checkout("react", 7).unwrap();
        assert_eq!(got.session_id, "s-1");
        assert_eq!(pool.metrics().pooled_sessions, 0);
        assert_eq!(pool.metrics().reused_total, 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_reused() {
        let pool = SessionPool::new(Duration::from_millis(50));
        pool.offer(session("s-1", "react", 7));
        sleep(Duration::from_millis(80)).await;

        assert!(pool.checkout("react", 7).is_none());
        assert_eq!(pool.metrics().expired_total, 1);
        assert_eq!(pool.metrics().pooled_sessions, 0);
    }

    #[test]
    fn test_session_is_bound_to_its_instance() {
        let pool = SessionPool::new(Duration::from_secs(60));
        pool.offer(session("s-1", "react", 7));

        assert!(pool.checkout("react", 8).is_none());
        // Still parked for the right instance.
        assert!(pool.checkout("react", 7).is_some());
    }

    #[test]
    fn test_marked_inactive_is_not_reused() {
        let pool = SessionPool::new(Duration::from_secs(60));
        pool.offer(session("s-1", "react", 7));

        assert!(pool.mark_inactive("s-1"));
        assert!(pool.checkout("react", 7).is_none());
        // Pruned as inactive, not as an expiry.
        assert_eq!(pool.metrics().expired_total, 0);
        assert!(!pool.mark_inactive("s-1"));
    }

    #[test]
    fn test_removed_session_is_gone() {
        let pool = SessionPool::new(Duration::from_secs(60));
        pool.offer(session("s-1", "react", 7));

        assert!(pool.remove("s-1"));
        assert_eq!(pool.metrics().pooled_sessions, 0);
        assert!(!pool.remove("s-1"));
    }

    #[test]
    fn test_offer_replaces_previous_entry() {
        let pool = SessionPool::new(Duration::from_secs(60));
        pool.offer(session("s-1", "react", 7));
        pool.offer(session("s-1", "react", 7));

        assert_eq!(pool.metrics().pooled_sessions, 1);
        assert_eq!(pool.metrics().offered_total, 2);
    }
}
