//! Session admission and lifecycle.
//!
//! The coordinator is the single owner of session records: it gates
//! creation against total and per-technology caps, tracks activity, owns
//! each session's idle timer, and tears sessions down exactly once.
//! Cleanup is idempotent by construction: whichever path gets there first
//! (idle timer, stale sweep, explicit cleanup, shutdown) removes the
//! record, and everyone else finds nothing to do.

use crate::config::SessionLimits;
use crate::pool::resource_pool::{InstanceLease, ResourcePool};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the coordinator needs to know about a new session.
pub struct SessionInfo {
    pub session_id: String,
    /// Canonical technology key.
    pub technology: String,
    /// Lease on the instance hosting the session.
    pub lease: InstanceLease,
}

/// Verdict from admission control.
#[derive(Debug, Clone)]
pub struct SessionAdmission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SessionAdmission {
    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

struct SessionRecord {
    technology: String,
    lease: InstanceLease,
    created_at: Instant,
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CoordinatorState {
    sessions: HashMap<String, SessionRecord>,
    per_tech: HashMap<String, usize>,
    created_total: u64,
    timed_out_total: u64,
    cleaned_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorMetrics {
    pub active_sessions: usize,
    pub sessions_by_technology: BTreeMap<String, usize>,
    pub created_total: u64,
    pub timed_out_total: u64,
    pub cleaned_total: u64,
}

pub struct SessionCoordinator {
    pool: Arc<ResourcePool>,
    limits: SessionLimits,
    state: Mutex<CoordinatorState>,
}

impl SessionCoordinator {
    pub fn new(pool: Arc<ResourcePool>, limits: SessionLimits) -> Self {
        Self {
            pool,
            limits,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Checks both caps. Denials carry a human-readable reason.
    pub fn can_create_session(&self, technology: &str) -> SessionAdmission {
        let st = self.lock();
        let total = st.sessions.len();
        if total >= self.limits.max_total_sessions {
            return SessionAdmission::denied(format!(
                "{total} of {} concurrent sessions in use",
                self.limits.max_total_sessions
            ));
        }
        let for_tech = st.per_tech.get(technology).copied().unwrap_or(0);
        if for_tech >= self.limits.max_sessions_per_technology {
            return SessionAdmission::denied(format!(
                "technology '{technology}' already has {for_tech} of {} concurrent sessions",
                self.limits.max_sessions_per_technology
            ));
        }
        SessionAdmission {
            allowed: true,
            reason: None,
        }
    }

    /// Registers a session, or rebinds an existing record to a new lease
    /// when a parked session is reused. Rebinding never double-counts.
    pub fn register_session(&self, info: SessionInfo) {
        let mut st = self.lock();
        let now = Instant::now();
        match st.sessions.get_mut(&info.session_id) {
            Some(record) => {
                debug!(session = %info.session_id, "rebound reused session");
                record.lease = info.lease;
                record.last_activity = now;
            }
            None => {
                debug!(
                    session = %info.session_id,
                    technology = %info.technology,
                    "session registered"
                );
                *st.per_tech.entry(info.technology.clone()).or_default() += 1;
                st.created_total += 1;
                self.pool.record_session_started(info.lease.instance_id());
                st.sessions.insert(
                    info.session_id,
                    SessionRecord {
                        technology: info.technology,
                        lease: info.lease,
                        created_at: now,
                        last_activity: now,
                        timer: None,
                    },
                );
            }
        }
    }

    pub fn update_session_activity(&self, session_id: &str) {
        if let Some(record) = self.lock().sessions.get_mut(session_id) {
            record.last_activity = Instant::now();
        }
    }

    /// Arms (or re-arms) the session's idle timer. When it fires, the
    /// session is cleaned up and `on_timeout` runs, unless some other path
    /// cleaned the session first.
    pub fn set_session_timeout(
        self: &Arc<Self>,
        session_id: &str,
        after: Duration,
        on_timeout: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let mut st = self.lock();
        let Some(record) = st.sessions.get_mut(session_id) else {
            return;
        };
        if let Some(old) = record.timer.take() {
            old.abort();
        }
        let coordinator = Arc::clone(self);
        let session_id = session_id.to_string();
        record.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            coordinator.expire_session(&session_id, on_timeout);
        }));
    }

    /// Removes the session record, cancels its timer, and returns its
    /// instance to the pool. Returns false when the session was already
    /// gone; calling this twice is harmless.
    pub fn cleanup_session(&self, session_id: &str) -> bool {
        let record = {
            let mut st = self.lock();
            let Some(record) = st.sessions.remove(session_id) else {
                return false;
            };
            if let Some(n) = st.per_tech.get_mut(&record.technology) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    st.per_tech.remove(&record.technology);
                }
            }
            st.cleaned_total += 1;
            record
        };
        if let Some(timer) = record.timer {
            timer.abort();
        }
        self.pool.record_session_closed(record.lease.instance_id());
        self.pool.release(&record.lease);
        debug!(
            session = %session_id,
            lived_secs = record.created_at.elapsed().as_secs(),
            "session cleaned up"
        );
        true
    }

    /// Cleans every session whose last activity is older than `older_than`.
    pub fn cleanup_stale_sessions(&self, older_than: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_activity) > older_than)
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = 0;
        for id in &stale {
            if self.cleanup_session(id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up stale sessions");
        }
        removed
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        let st = self.lock();
        CoordinatorMetrics {
            active_sessions: st.sessions.len(),
            sessions_by_technology: st
                .per_tech
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            created_total: st.created_total,
            timed_out_total: st.timed_out_total,
            cleaned_total: st.cleaned_total,
        }
    }

    /// Cleans up every session. Safe to call more than once.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.lock().sessions.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(sessions = ids.len(), "cleaning up sessions for shutdown");
        for id in &ids {
            self.cleanup_session(id);
        }
    }

    fn expire_session(&self, session_id: &str, on_timeout: Option<Box<dyn FnOnce() + Send>>) {
        if self.cleanup_session(session_id) {
            self.lock().timed_out_total += 1;
            warn!(session = %session_id, "session idle timeout");
            if let Some(callback) = on_timeout {
                callback();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
