//! Shared pool of backend agent instances.
//!
//! Instances are expensive: each one is a spawned process bound to a local
//! port with a repository loaded into its context. The pool reuses idle
//! instances, enforces per-technology and total caps, parks excess
//! requests in a bounded FIFO queue, and evicts instances that sit idle
//! too long.
//!
//! Acquisition hands out an [`InstanceLease`] alongside the handle. The
//! lease carries a generation number that makes `release` safe to call
//! from multiple cleanup paths: only the holder of the current generation
//! can return the instance, so a late idle-timeout cleanup cannot yank an
//! instance out from under the next question.

use crate::config::PoolLimits;
use crate::ports::agent_gateway::{AgentGateway, AgentTransport, GatewayError, InstanceConfig};
use sage_domain::Technology;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("instance pool exhausted: {0} requests already waiting")]
    QueueFull(usize),

    #[error("timed out waiting for a '{0}' instance")]
    AcquireTimeout(String),

    #[error("instance pool is shut down")]
    ShutDown,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// A live agent instance. Shared between the pool's bookkeeping and every
/// caller currently using the instance.
pub struct InstanceHandle {
    id: u64,
    technology: String,
    port: u16,
    transport: Arc<dyn AgentTransport>,
}

impl InstanceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn technology(&self) -> &str {
        &self.technology
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.id)
            .field("technology", &self.technology)
            .field("port", &self.port)
            .finish()
    }
}

/// Proof of an acquisition. `release` ignores leases whose generation no
/// longer matches the instance, which makes double-release a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLease {
    instance_id: u64,
    generation: u64,
}

impl InstanceLease {
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }
}

/// Result of [`ResourcePool::acquire`].
#[derive(Debug)]
pub struct AcquiredInstance {
    pub handle: Arc<InstanceHandle>,
    pub lease: InstanceLease,
    /// False when the pool spawned a fresh instance for this request.
    pub reused: bool,
}

struct PooledInstance {
    handle: Arc<InstanceHandle>,
    last_used: Instant,
    in_use: bool,
    generation: u64,
    session_count: u32,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<AcquiredInstance, PoolError>>,
}

#[derive(Debug, Default, Clone)]
struct PoolStats {
    created_total: u64,
    reused_total: u64,
    evicted_total: u64,
    queue_timeouts: u64,
    queue_rejections: u64,
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<String, Vec<PooledInstance>>,
    queues: HashMap<String, VecDeque<Waiter>>,
    waiting: usize,
    /// Ports held by live or in-flight instances.
    reserved_ports: BTreeSet<u16>,
    /// Ports that failed with a conflict; never offered again.
    burned_ports: BTreeSet<u16>,
    pending: HashMap<String, usize>,
    pending_total: usize,
    next_instance_id: u64,
    next_waiter_id: u64,
    acquire_seq: u64,
    shut_down: bool,
    stats: PoolStats,
}

/// Snapshot exposed by [`ResourcePool::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_instances: usize,
    pub active_instances: usize,
    pub idle_instances: usize,
    pub queued_requests: usize,
    pub instances_by_technology: BTreeMap<String, usize>,
    pub created_total: u64,
    pub reused_total: u64,
    pub evicted_total: u64,
    pub queue_timeouts: u64,
    pub queue_rejections: u64,
}

pub struct ResourcePool {
    gateway: Arc<dyn AgentGateway>,
    limits: PoolLimits,
    state: Arc<Mutex<PoolState>>,
    sweeper: CancellationToken,
}

enum Plan {
    Ready(AcquiredInstance),
    Create(u16),
    Wait {
        waiter_id: u64,
        rx: oneshot::Receiver<Result<AcquiredInstance, PoolError>>,
    },
}

impl ResourcePool {
    /// Creates the pool and starts its idle-instance sweeper. Must run
    /// inside a tokio runtime.
    pub fn new(gateway: Arc<dyn AgentGateway>, limits: PoolLimits) -> Self {
        let pool = Self {
            gateway,
            limits,
            state: Arc::new(Mutex::new(PoolState::default())),
            sweeper: CancellationToken::new(),
        };
        pool.spawn_sweeper();
        pool
    }

    /// Hands out an instance for `technology`: an idle one when available,
    /// a freshly spawned one while capacity remains, otherwise the request
    /// queues FIFO until a release or the queue timeout.
    pub async fn acquire(
        &self,
        technology: &Technology,
        config: &InstanceConfig,
    ) -> Result<AcquiredInstance, PoolError> {
        let key = technology.key();
        let plan = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.shut_down {
                return Err(PoolError::ShutDown);
            }
            if let Some(acquired) = Self::checkout_idle(st, &key) {
                Plan::Ready(acquired)
            } else if Self::has_capacity(st, &key, &self.limits) {
                let Some(port) = Self::lowest_free_port(st, self.limits.base_port) else {
                    return Err(PoolError::Gateway(GatewayError::SpawnFailed(
                        "no free ports above base".to_string(),
                    )));
                };
                st.reserved_ports.insert(port);
                *st.pending.entry(key.clone()).or_default() += 1;
                st.pending_total += 1;
                Plan::Create(port)
            } else {
                if st.waiting >= self.limits.max_queue_size {
                    st.stats.queue_rejections += 1;
                    return Err(PoolError::QueueFull(st.waiting));
                }
                let (tx, rx) = oneshot::channel();
                st.next_waiter_id += 1;
                let waiter_id = st.next_waiter_id;
                st.queues
                    .entry(key.clone())
                    .or_default()
                    .push_back(Waiter { id: waiter_id, tx });
                st.waiting += 1;
                debug!(
                    technology = %key,
                    waiting = st.waiting,
                    "instance pool saturated, queuing request"
                );
                Plan::Wait { waiter_id, rx }
            }
        };

        match plan {
            Plan::Ready(acquired) => {
                debug!(
                    technology = %key,
                    instance = acquired.handle.id(),
                    "reusing idle instance"
                );
                Ok(acquired)
            }
            Plan::Create(port) => self.create_instance(&key, port, config).await,
            Plan::Wait { waiter_id, rx } => self.await_grant(&key, waiter_id, rx).await,
        }
    }

    /// Returns an instance to the pool. The oldest queued request for the
    /// same technology, if any, takes over immediately; otherwise the
    /// instance goes idle. Stale or repeated leases are ignored.
    pub fn release(&self, lease: &InstanceLease) {
        let mut guard = self.lock();
        let st = &mut *guard;

        let Some(key) = st.instances.iter().find_map(|(k, list)| {
            list.iter()
                .any(|i| i.handle.id == lease.instance_id)
                .then(|| k.clone())
        }) else {
            debug!(instance = lease.instance_id, "release for unknown instance");
            return;
        };

        let PoolState {
            instances,
            queues,
            waiting,
            acquire_seq,
            stats,
            ..
        } = st;
        let Some(inst) = instances
            .get_mut(&key)
            .and_then(|list| list.iter_mut().find(|i| i.handle.id == lease.instance_id))
        else {
            return;
        };
        if !inst.in_use || inst.generation != lease.generation {
            debug!(instance = lease.instance_id, "stale lease release ignored");
            return;
        }
        inst.last_used = Instant::now();

        let queue = queues.entry(key.clone()).or_default();
        loop {
            let Some(waiter) = queue.pop_front() else {
                inst.in_use = false;
                debug!(technology = %key, instance = inst.handle.id, "instance idle");
                break;
            };
            *waiting = waiting.saturating_sub(1);
            *acquire_seq += 1;
            inst.generation = *acquire_seq;
            let acquired = AcquiredInstance {
                handle: Arc::clone(&inst.handle),
                lease: InstanceLease {
                    instance_id: inst.handle.id,
                    generation: inst.generation,
                },
                reused: true,
            };
            if waiter.tx.send(Ok(acquired)).is_ok() {
                stats.reused_total += 1;
                debug!(
                    technology = %key,
                    instance = inst.handle.id,
                    "handed released instance to queued request"
                );
                break;
            }
            // That waiter gave up; try the next one.
        }
    }

    /// Notes that a session opened on `instance_id`.
    pub fn record_session_started(&self, instance_id: u64) {
        let mut guard = self.lock();
        Self::with_instance(&mut guard, instance_id, |inst| {
            inst.session_count += 1;
        });
    }

    /// Notes that a session on `instance_id` ended.
    pub fn record_session_closed(&self, instance_id: u64) {
        let mut guard = self.lock();
        Self::with_instance(&mut guard, instance_id, |inst| {
            inst.session_count = inst.session_count.saturating_sub(1);
        });
    }

    /// Looks up the handle for a live instance.
    pub fn instance(&self, instance_id: u64) -> Option<Arc<InstanceHandle>> {
        let mut guard = self.lock();
        Self::with_instance(&mut guard, instance_id, |inst| Arc::clone(&inst.handle))
    }

    /// Evicts every instance idle longer than the configured timeout and
    /// closes its transport. Returns how many were evicted. The background
    /// sweeper calls this on its interval.
    pub async fn evict_idle(&self) -> usize {
        let evicted = Self::collect_stale(&self.state, self.limits.instance_idle_timeout);
        let count = evicted.len();
        for handle in evicted {
            if let Err(e) = handle.transport().close().await {
                debug!(instance = handle.id(), "error closing evicted instance: {e}");
            }
        }
        count
    }

    pub fn metrics(&self) -> PoolMetrics {
        let guard = self.lock();
        let mut by_tech = BTreeMap::new();
        let mut total = 0;
        let mut active = 0;
        for (key, list) in &guard.instances {
            by_tech.insert(key.clone(), list.len());
            total += list.len();
            active += list.iter().filter(|i| i.in_use).count();
        }
        PoolMetrics {
            total_instances: total,
            active_instances: active,
            idle_instances: total - active,
            queued_requests: guard.waiting,
            instances_by_technology: by_tech,
            created_total: guard.stats.created_total,
            reused_total: guard.stats.reused_total,
            evicted_total: guard.stats.evicted_total,
            queue_timeouts: guard.stats.queue_timeouts,
            queue_rejections: guard.stats.queue_rejections,
        }
    }

    /// Rejects queued requests, closes every instance, and stops the
    /// sweeper. Safe to call more than once.
    pub async fn shutdown(&self) {
        let handles = {
            let mut st = self.lock();
            if st.shut_down {
                Vec::new()
            } else {
                st.shut_down = true;
                for queue in st.queues.values_mut() {
                    while let Some(waiter) = queue.pop_front() {
                        let _ = waiter.tx.send(Err(PoolError::ShutDown));
                    }
                }
                st.queues.clear();
                st.waiting = 0;
                st.reserved_ports.clear();
                let handles: Vec<_> = st
                    .instances
                    .values()
                    .flat_map(|list| list.iter())
                    .map(|inst| Arc::clone(&inst.handle))
                    .collect();
                st.instances.clear();
                info!(instances = handles.len(), "shutting down instance pool");
                handles
            }
        };
        self.sweeper.cancel();
        for handle in handles {
            if let Err(e) = handle.transport().close().await {
                debug!(
                    instance = handle.id(),
                    "error closing instance during shutdown: {e}"
                );
            }
        }
    }

    // ==================== internals ====================

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkout_idle(st: &mut PoolState, key: &str) -> Option<AcquiredInstance> {
        let PoolState {
            instances,
            acquire_seq,
            stats,
            ..
        } = st;
        let inst = instances.get_mut(key)?.iter_mut().find(|i| !i.in_use)?;
        *acquire_seq += 1;
        inst.in_use = true;
        inst.last_used = Instant::now();
        inst.generation = *acquire_seq;
        stats.reused_total += 1;
        Some(AcquiredInstance {
            handle: Arc::clone(&inst.handle),
            lease: InstanceLease {
                instance_id: inst.handle.id,
                generation: inst.generation,
            },
            reused: true,
        })
    }

    fn has_capacity(st: &PoolState, key: &str, limits: &PoolLimits) -> bool {
        let for_tech = st.instances.get(key).map_or(0, Vec::len)
            + st.pending.get(key).copied().unwrap_or(0);
        let total: usize =
            st.instances.values().map(Vec::len).sum::<usize>() + st.pending_total;
        for_tech < limits.max_per_technology && total < limits.max_total
    }

    fn lowest_free_port(st: &PoolState, base: u16) -> Option<u16> {
        (base..=u16::MAX)
            .find(|p| !st.reserved_ports.contains(p) && !st.burned_ports.contains(p))
    }

    async fn create_instance(
        &self,
        key: &str,
        first_port: u16,
        config: &InstanceConfig,
    ) -> Result<AcquiredInstance, PoolError> {
        let mut port = first_port;
        let mut attempt = 0;
        loop {
            match self.gateway.create_instance(port, config).await {
                Ok(transport) => return self.finish_create(key, port, transport),
                Err(GatewayError::PortUnavailable(_))
                    if attempt + 1 < self.limits.port_retry_attempts =>
                {
                    let next = {
                        let mut st = self.lock();
                        st.reserved_ports.remove(&port);
                        st.burned_ports.insert(port);
                        match Self::lowest_free_port(&st, self.limits.base_port) {
                            Some(p) => {
                                st.reserved_ports.insert(p);
                                Some(p)
                            }
                            None => None,
                        }
                    };
                    match next {
                        Some(p) => {
                            warn!(conflicted = port, retrying_on = p, "port conflict while spawning instance");
                            port = p;
                        }
                        None => {
                            return Err(self.abandon_create(
                                key,
                                None,
                                GatewayError::SpawnFailed("no free ports above base".to_string()),
                            ));
                        }
                    }
                }
                Err(e) => return Err(self.abandon_create(key, Some(port), e)),
            }
            attempt += 1;
        }
    }

    fn finish_create(
        &self,
        key: &str,
        port: u16,
        transport: Arc<dyn AgentTransport>,
    ) -> Result<AcquiredInstance, PoolError> {
        let mut st = self.lock();
        Self::settle_pending(&mut st, key);
        if st.shut_down {
            drop(st);
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
            return Err(PoolError::ShutDown);
        }
        st.acquire_seq += 1;
        st.next_instance_id += 1;
        let id = st.next_instance_id;
        let generation = st.acquire_seq;
        let handle = Arc::new(InstanceHandle {
            id,
            technology: key.to_string(),
            port,
            transport,
        });
        st.instances
            .entry(key.to_string())
            .or_default()
            .push(PooledInstance {
                handle: Arc::clone(&handle),
                last_used: Instant::now(),
                in_use: true,
                generation,
                session_count: 0,
            });
        st.stats.created_total += 1;
        info!(technology = %key, port, instance = id, "spawned agent instance");
        Ok(AcquiredInstance {
            handle,
            lease: InstanceLease {
                instance_id: id,
                generation,
            },
            reused: false,
        })
    }

    fn abandon_create(&self, key: &str, port: Option<u16>, err: GatewayError) -> PoolError {
        let mut st = self.lock();
        if let Some(p) = port {
            st.reserved_ports.remove(&p);
        }
        Self::settle_pending(&mut st, key);
        PoolError::Gateway(err)
    }

    fn settle_pending(st: &mut PoolState, key: &str) {
        if let Some(n) = st.pending.get_mut(key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                st.pending.remove(key);
            }
        }
        st.pending_total = st.pending_total.saturating_sub(1);
    }

    async fn await_grant(
        &self,
        key: &str,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<AcquiredInstance, PoolError>>,
    ) -> Result<AcquiredInstance, PoolError> {
        match tokio::time::timeout(self.limits.queue_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::ShutDown),
            Err(_) => {
                // A grant may have landed in the same instant the timeout
                // fired. If our waiter entry is already gone, the grant won
                // and the instance is in the channel.
                let granted = {
                    let mut st = self.lock();
                    if Self::remove_waiter(&mut st, key, waiter_id) {
                        st.stats.queue_timeouts += 1;
                        None
                    } else {
                        rx.try_recv().ok()
                    }
                };
                match granted {
                    Some(result) => result,
                    None => {
                        warn!(technology = %key, "timed out waiting for an instance");
                        Err(PoolError::AcquireTimeout(key.to_string()))
                    }
                }
            }
        }
    }

    fn remove_waiter(st: &mut PoolState, key: &str, waiter_id: u64) -> bool {
        let Some(queue) = st.queues.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.id != waiter_id);
        let removed = queue.len() < before;
        if removed {
            st.waiting = st.waiting.saturating_sub(1);
        }
        removed
    }

    fn with_instance<R>(
        st: &mut PoolState,
        instance_id: u64,
        f: impl FnOnce(&mut PooledInstance) -> R,
    ) -> Option<R> {
        st.instances
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|i| i.handle.id == instance_id)
            .map(f)
    }

    fn collect_stale(state: &Mutex<PoolState>, idle_timeout: Duration) -> Vec<Arc<InstanceHandle>> {
        let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut evicted = Vec::new();
        for list in st.instances.values_mut() {
            list.retain(|inst| {
                let stale =
                    !inst.in_use && now.duration_since(inst.last_used) > idle_timeout;
                if stale {
                    if inst.session_count > 0 {
                        debug!(
                            instance = inst.handle.id,
                            sessions = inst.session_count,
                            "evicting idle instance with pooled sessions"
                        );
                    }
                    evicted.push(Arc::clone(&inst.handle));
                }
                !stale
            });
        }
        st.instances.retain(|_, list| !list.is_empty());
        for handle in &evicted {
            st.reserved_ports.remove(&handle.port);
        }
        st.stats.evicted_total += evicted.len() as u64;
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle agent instances");
        }
        evicted
    }

    fn spawn_sweeper(&self) {
        let state = Arc::clone(&self.state);
        let idle_timeout = self.limits.instance_idle_timeout;
        let interval = self.limits.sweep_interval;
        let token = self.sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = Self::collect_stale(&state, idle_timeout);
                        for handle in evicted {
                            if let Err(e) = handle.transport().close().await {
                                debug!(instance = handle.id(), "error closing evicted instance: {e}");
                            }
                        }
                    }
                }
            }
        });
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::agent_gateway::EventSubscription;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    struct MockTransport {
        port: u16,
        closed: AtomicBool,
    }

    #[async_trait]
    impl AgentTransport for MockTransport {
        async fn create_session(&self) -> Result<String, GatewayError> {
            Ok(format!("sess-{}", self.port))
        }

        fn subscribe_events(&self) -> EventSubscription {
            let (_tx, rx) = mpsc::unbounded_channel();
            EventSubscription::new(rx)
        }

        async fn send_prompt(&self, _session_id: &str, _prompt: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), GatewayError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockGateway {
        create_calls: AtomicU32,
        fail_ports: Mutex<HashSet<u16>>,
        transports: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockGateway {
        fn failing_on(ports: &[u16]) -> Self {
            Self {
                fail_ports: Mutex::new(ports.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> u32 {
            self.create_calls.load(Ordering::SeqCst)
        }

        fn all_closed(&self) -> bool {
            self.transports
                .lock()
                .unwrap()
                .iter()
                .all(|t| t.closed.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl AgentGateway for MockGateway {
        async fn create_instance(
            &self,
            port: u16,
            _config: &InstanceConfig,
        ) -> Result<Arc<dyn AgentTransport>, GatewayError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_ports.lock().unwrap().contains(&port) {
                return Err(GatewayError::PortUnavailable(port));
            }
            let transport = Arc::new(MockTransport {
                port,
                closed: AtomicBool::new(false),
            });
            self.transports.lock().unwrap().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    fn limits() -> PoolLimits {
        PoolLimits::default()
            .with_base_port(50000)
            .with_queue_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_secs(3600))
    }

    fn config_for(tech: &str) -> InstanceConfig {
        InstanceConfig {
            technology: Technology::new(tech),
            repo_path: PathBuf::from("/tmp/repos").join(tech),
            model: None,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_capacity_caps_are_enforced() {
        let gateway = Arc::new(MockGateway::default());
        let pool = ResourcePool::new(
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            limits().with_max_per_technology(2).with_max_total(3),
        );

        let react = Technology::new("react");
        let vue = Technology::new("vue");
        let _a = pool.acquire(&react, &config_for("react")).await.unwrap();
        let _b = pool.acquire(&react, &config_for("react")).await.unwrap();
        let _c = pool.acquire(&vue, &config_for("vue")).await.unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.total_instances, 3);
        assert_eq!(metrics.active_instances, 3);
        assert_eq!(metrics.instances_by_technology["react"], 2);

        // A third react request must queue (per-tech cap), and with nobody
        // releasing it times out.
        let err = pool
            .acquire(&react, &config_for("react"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout(_)));
        assert_eq!(pool.metrics().total_instances, 3);
        assert_eq!(pool.metrics().queue_timeouts, 1);
    }

    #[tokio::test]
    async fn test_reuses_idle_instance() {
        let gateway = Arc::new(MockGateway::default());
        let pool = ResourcePool::new(Arc::clone(&gateway) as Arc<dyn AgentGateway>, limits());
        let react = Technology::new("react");

        let first = pool.acquire(&react, &config_for("react")).await.unwrap();
        let first_id = first.handle.id();
        assert!(!first.reused);
        pool.release(&first.lease);

        let second = pool.acquire(&react, &config_for("react")).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.handle.id(), first_id);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_requests_are_served_fifo() {
        let gateway = Arc::new(MockGateway::default());
        let pool = Arc::new(ResourcePool::new(
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            limits()
                .with_max_per_technology(1)
                .with_max_total(1)
                .with_queue_timeout(Duration::from_secs(5)),
        ));
        let react = Technology::new("react");

        let first = pool.acquire(&react, &config_for("react")).await.unwrap();
        let first_id = first.handle.id();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in [2u32, 3] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let got = pool
                    .acquire(&Technology::new("react"), &config_for("react"))
                    .await
                    .unwrap();
                order.lock().unwrap().push(n);
                let id = got.handle.id();
                pool.release(&got.lease);
                id
            }));
            // Give each waiter time to enqueue so the queue order is 2, 3.
            sleep(Duration::from_millis(30)).await;
        }

        pool.release(&first.lease);
        let ids: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(*order.lock().unwrap(), vec![2, 3]);
        assert_eq!(ids, vec![first_id, first_id]);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let gateway = Arc::new(MockGateway::default());
        let pool = Arc::new(ResourcePool::new(
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            limits()
                .with_max_per_technology(1)
                .with_max_total(1)
                .with_max_queue_size(1)
                .with_queue_timeout(Duration::from_secs(5)),
        ));
        let react = Technology::new("react");
        let held = pool.acquire(&react, &config_for("react")).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(&Technology::new("react"), &config_for("react"))
                    .await
            })
        };
        sleep(Duration::from_millis(30)).await;

        let err = pool
            .acquire(&react, &config_for("react"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::QueueFull(1)));
        assert_eq!(pool.metrics().queue_rejections, 1);

        pool.release(&held.lease);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ports_allocated_from_base_upward() {
        let gateway = Arc::new(MockGateway::default());
        let pool = ResourcePool::new(Arc::clone(&gateway) as Arc<dyn AgentGateway>, limits());

        let a = pool
            .acquire(&Technology::new("react"), &config_for("react"))
            .await
            .unwrap();
        let b = pool
            .acquire(&Technology::new("vue"), &config_for("vue"))
            .await
            .unwrap();
        assert_eq!(a.handle.port(), 50000);
        assert_eq!(b.handle.port(), 50001);
    }

    #[tokio::test]
    async fn test_port_conflict_retries_on_next_port() {
        let gateway = Arc::new(MockGateway::failing_on(&[50000]));
        let pool = ResourcePool::new(Arc::clone(&gateway) as Arc<dyn AgentGateway>, limits());

        let got = pool
            .acquire(&Technology::new("react"), &config_for("react"))
            .await
            .unwrap();
        assert_eq!(got.handle.port(), 50001);
        assert_eq!(gateway.calls(), 2);

        // The conflicted port is never offered again.
        let other = pool
            .acquire(&Technology::new("vue"), &config_for("vue"))
            .await
            .unwrap();
        assert_eq!(other.handle.port(), 50002);
    }

    #[tokio::test]
    async fn test_stale_lease_release_is_ignored() {
        let gateway = Arc::new(MockGateway::default());
        let pool = ResourcePool::new(Arc::clone(&gateway) as Arc<dyn AgentGateway>, limits());
        let react = Technology::new("react");

        let first = pool.acquire(&react, &config_for("react")).await.unwrap();
        let old_lease = first.lease.clone();
        pool.release(&old_lease);

        let second = pool.acquire(&react, &config_for("react")).await.unwrap();
        assert_eq!(second.handle.id(), first.handle.id());

        // Double release with the outdated lease must not free the
        // instance now held by `second`.
        pool.release(&old_lease);
        assert_eq!(pool.metrics().active_instances, 1);

        pool.release(&second.lease);
        assert_eq!(pool.metrics().active_instances, 0);
        assert_eq!(pool.metrics().idle_instances, 1);
    }

    #[tokio::test]
    async fn test_idle_instances_are_evicted() {
        let gateway = Arc::new(MockGateway::default());
        let pool = ResourcePool::new(
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            limits().with_instance_idle_timeout(Duration::from_millis(50)),
        );
        let react = Technology::new("react");

        let got = pool.acquire(&react, &config_for("react")).await.unwrap();
        pool.release(&got.lease);
        sleep(Duration::from_millis(80)).await;

        // An in-use instance survives the sweep.
        let busy = pool.acquire(&Technology::new("vue"), &config_for("vue")).await.unwrap();

        assert_eq!(pool.evict_idle().await, 1);
        let metrics = pool.metrics();
        assert_eq!(metrics.total_instances, 1);
        assert_eq!(metrics.evicted_total, 1);
        drop(busy);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters_and_closes_instances() {
        let gateway = Arc::new(MockGateway::default());
        let pool = Arc::new(ResourcePool::new(
            Arc::clone(&gateway) as Arc<dyn AgentGateway>,
            limits()
                .with_max_per_technology(1)
                .with_max_total(1)
                .with_queue_timeout(Duration::from_secs(5)),
        ));
        let react = Technology::new("react");
        let _held = pool.acquire(&react, &config_for("react")).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(&Technology::new("react"), &config_for("react"))
                    .await
            })
        };
        sleep(Duration::from_millis(30)).await;

        pool.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::ShutDown)));
        assert!(gateway.all_closed());

        // Shutdown is idempotent and later acquisitions are refused.
        pool.shutdown().await;
        let err = pool
            .acquire(&react, &config_for("react"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ShutDown));
    }
}
