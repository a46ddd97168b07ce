//! Stream registry: one event processor per live answer stream.
//!
//! The manager owns a processor per stream, pumps raw subscription events
//! into it on a detached task, tracks activity for idle timeout, and
//! sweeps finished streams out after a short retention window. Processing
//! failures surface through stream status, never to the caller of
//! [`create_stream`].
//!
//! [`create_stream`]: EventStreamManager::create_stream

use crate::config::{ProcessorConfig, StreamingConfig};
use crate::ports::agent_gateway::EventSubscription;
use crate::streaming::handler::{EventHandler, HandlerRegistration};
use crate::streaming::processor::{EventProcessor, ProcessorError};
use sage_domain::StreamStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream '{0}' already exists")]
    StreamExists(String),

    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    #[error("stream manager is shut down")]
    ShutDown,

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Per-stream settings. Unset fields fall back to the manager defaults.
#[derive(Clone)]
pub struct StreamConfig {
    pub stream_id: String,
    pub timeout: Option<Duration>,
    pub processor: Option<ProcessorConfig>,
    pub handlers: Vec<HandlerRegistration>,
}

impl StreamConfig {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            timeout: None,
            processor: None,
            handlers: Vec::new(),
        }
    }

    // ==================== Builder Methods ====================

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_handler(
        mut self,
        name: impl Into<String>,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.handlers
            .push(HandlerRegistration::new(name, priority, handler));
        self
    }
}

struct StreamRecord {
    processor: Arc<EventProcessor>,
    status: StreamStatus,
    event_count: u64,
    started_at: Instant,
    last_activity: Instant,
    terminal_at: Option<Instant>,
    error: Option<String>,
    timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Default, Clone)]
struct StreamStats {
    total_created: u64,
    completed_total: u64,
    errored_total: u64,
    timed_out_total: u64,
    removed_total: u64,
    events_total: u64,
}

struct ManagerInner {
    streams: HashMap<String, StreamRecord>,
    stats: StreamStats,
    shut_down: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamManagerMetrics {
    pub active_streams: usize,
    pub total_created: u64,
    pub completed_total: u64,
    pub errored_total: u64,
    pub timed_out_total: u64,
    pub removed_total: u64,
    pub events_total: u64,
}

pub struct EventStreamManager {
    inner: Arc<Mutex<ManagerInner>>,
    defaults: StreamingConfig,
    sweep_token: CancellationToken,
}

impl EventStreamManager {
    /// Creates the manager and starts its sweep task. Must run inside a
    /// tokio runtime.
    pub fn new(defaults: StreamingConfig) -> Self {
        let inner = Arc::new(Mutex::new(ManagerInner {
            streams: HashMap::new(),
            stats: StreamStats::default(),
            shut_down: false,
        }));
        let sweep_token = CancellationToken::new();

        let sweep_inner = Arc::clone(&inner);
        let sweep_defaults = defaults.clone();
        let token = sweep_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_defaults.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::sweep(&sweep_inner, &sweep_defaults).await;
                    }
                }
            }
        });

        Self {
            inner,
            defaults,
            sweep_token,
        }
    }

    /// Registers a stream and starts pumping its source through a fresh
    /// processor on a detached task. Fails when the id is already taken.
    pub fn create_stream(
        &self,
        source: EventSubscription,
        config: StreamConfig,
    ) -> Result<String, StreamError> {
        let stream_id = config.stream_id;
        let cancel = CancellationToken::new();
        let processor = {
            let mut inner = self.lock();
            if inner.shut_down {
                return Err(StreamError::ShutDown);
            }
            if inner.streams.contains_key(&stream_id) {
                return Err(StreamError::StreamExists(stream_id));
            }
            // Dropping the processor on a registration error cancels its
            // dispatch task, so the early returns below do not leak.
            let processor = Arc::new(EventProcessor::new(
                config
                    .processor
                    .unwrap_or_else(|| self.defaults.processor.clone()),
            ));
            for registration in config.handlers {
                processor.register_handler(
                    registration.name,
                    registration.priority,
                    registration.handler,
                )?;
            }
            let now = Instant::now();
            inner.stats.total_created += 1;
            inner.streams.insert(
                stream_id.clone(),
                StreamRecord {
                    processor: Arc::clone(&processor),
                    status: StreamStatus::Active,
                    event_count: 0,
                    started_at: now,
                    last_activity: now,
                    terminal_at: None,
                    error: None,
                    timeout: config.timeout.unwrap_or(self.defaults.stream_timeout),
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            processor
        };

        debug!(stream = %stream_id, "stream created");
        let task = tokio::spawn(Self::run_stream(
            Arc::clone(&self.inner),
            stream_id.clone(),
            source,
            processor,
            cancel,
        ));
        let mut inner = self.lock();
        if let Some(record) = inner.streams.get_mut(&stream_id) {
            record.task = Some(task);
        }
        Ok(stream_id)
    }

    pub fn stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.lock().streams.get(stream_id).map(|r| r.status)
    }

    /// Stops one stream: marks it completed, halts its pump and processor,
    /// and leaves the terminal record behind for the retention sweep.
    pub async fn stop_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        let (processor, cancel, task) = {
            let mut inner = self.lock();
            let ManagerInner { streams, stats, .. } = &mut *inner;
            let record = streams
                .get_mut(stream_id)
                .ok_or_else(|| StreamError::StreamNotFound(stream_id.to_string()))?;
            if record.status == StreamStatus::Active {
                record.status = StreamStatus::Completed;
                record.terminal_at = Some(Instant::now());
                stats.completed_total += 1;
            }
            (
                Arc::clone(&record.processor),
                record.cancel.clone(),
                record.task.take(),
            )
        };
        cancel.cancel();
        processor.shutdown().await;
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(stream = %stream_id, "stream stopped");
        Ok(())
    }

    /// Runs one removal pass and returns how many streams were removed.
    /// The periodic sweep task calls the same logic.
    pub async fn cleanup_stale_streams(&self) -> usize {
        Self::sweep(&self.inner, &self.defaults).await
    }

    /// Stops every stream concurrently.
    pub async fn stop_all_streams(&self) {
        let ids: Vec<String> = self.lock().streams.keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop_stream(id));
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result
                && !matches!(e, StreamError::StreamNotFound(_))
            {
                warn!("stream stop failed: {e}");
            }
        }
    }

    pub fn metrics(&self) -> StreamManagerMetrics {
        let inner = self.lock();
        StreamManagerMetrics {
            active_streams: inner
                .streams
                .values()
                .filter(|r| r.status == StreamStatus::Active)
                .count(),
            total_created: inner.stats.total_created,
            completed_total: inner.stats.completed_total,
            errored_total: inner.stats.errored_total,
            timed_out_total: inner.stats.timed_out_total,
            removed_total: inner.stats.removed_total,
            events_total: inner.stats.events_total,
        }
    }

    /// Stops all streams, halts the sweep task, and clears the registry.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
        }
        self.stop_all_streams().await;
        self.sweep_token.cancel();
        let mut inner = self.lock();
        let cleared = inner.streams.len();
        inner.streams.clear();
        if cleared > 0 {
            debug!(streams = cleared, "stream manager cleared");
        }
    }

    // ==================== internals ====================

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Detached per-stream task: forwards source events into the
    /// processor, keeping activity bookkeeping current, then marks the
    /// record terminal once both sides finish.
    async fn run_stream(
        inner: Arc<Mutex<ManagerInner>>,
        stream_id: String,
        mut source: EventSubscription,
        processor: Arc<EventProcessor>,
        cancel: CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = async {
            // Owns tx so the processor's feed closes when the source ends.
            let tx = tx;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = source.next_event() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                {
                    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    guard.stats.events_total += 1;
                    if let Some(record) = guard.streams.get_mut(&stream_id) {
                        record.event_count += 1;
                        record.last_activity = Instant::now();
                        if record.error.is_none()
                            && let Some(message) = event.error_message()
                        {
                            record.error = Some(message.to_string());
                        }
                    }
                }
                if tx.send(event).is_err() {
                    break;
                }
            }
        };
        let process = processor.process_event_stream(EventSubscription::new(rx));
        let (_, processed) = tokio::join!(pump, process);
        if let Err(e) = processed {
            debug!(stream = %stream_id, "stream processing ended early: {e}");
        }

        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        let ManagerInner { streams, stats, .. } = &mut *guard;
        if let Some(record) = streams.get_mut(&stream_id)
            && record.status == StreamStatus::Active
        {
            record.terminal_at = Some(Instant::now());
            match record.error.clone() {
                Some(message) => {
                    record.status = StreamStatus::Error;
                    stats.errored_total += 1;
                    warn!(stream = %stream_id, error = %message, "stream ended with error");
                }
                None => {
                    record.status = StreamStatus::Completed;
                    stats.completed_total += 1;
                    debug!(
                        stream = %stream_id,
                        events = record.event_count,
                        lived_secs = record.started_at.elapsed().as_secs(),
                        "stream completed"
                    );
                }
            }
        }
    }

    /// One sweep pass: idle active streams become `Timeout` and leave;
    /// terminal streams past the retention window leave too.
    async fn sweep(inner: &Arc<Mutex<ManagerInner>>, defaults: &StreamingConfig) -> usize {
        let now = Instant::now();
        let removed: Vec<(String, StreamRecord)> = {
            let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            let ManagerInner { streams, stats, .. } = &mut *guard;
            let mut ids = Vec::new();
            for (id, record) in streams.iter_mut() {
                if record.status == StreamStatus::Active {
                    if now.duration_since(record.last_activity) > record.timeout {
                        record.status = StreamStatus::Timeout;
                        record.terminal_at = Some(now);
                        stats.timed_out_total += 1;
                        warn!(stream = %id, "stream idle past timeout, removing");
                        ids.push(id.clone());
                    }
                } else if record
                    .terminal_at
                    .is_some_and(|t| now.duration_since(t) > defaults.terminal_retention)
                {
                    ids.push(id.clone());
                }
            }
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = streams.remove(&id) {
                    stats.removed_total += 1;
                    out.push((id, record));
                }
            }
            out
        };

        let count = removed.len();
        for (id, mut record) in removed {
            record.cancel.cancel();
            record.processor.shutdown().await;
            if let Some(task) = record.task.take() {
                let _ = task.await;
            }
            debug!(stream = %id, "stream removed");
        }
        count
    }
}

impl Drop for EventStreamManager {
    fn drop(&mut self) {
        self.sweep_token.cancel();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for record in inner.streams.values() {
            record.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::handler::HandlerError;
    use async_trait::async_trait;
    use sage_domain::AgentEvent;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::sleep;

    struct Collector {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Collector {
        fn can_handle(&self, _event: &AgentEvent) -> bool {
            true
        }

        async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
            self.seen
                .lock()
                .unwrap()
                .push(event.content().unwrap_or("").to_string());
            Ok(())
        }
    }

    fn closed_source(events: Vec<AgentEvent>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        EventSubscription::new(rx)
    }

    fn open_source() -> (UnboundedSender<AgentEvent>, EventSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, EventSubscription::new(rx))
    }

    async fn wait_for_status(
        manager: &EventStreamManager,
        stream_id: &str,
        expected: StreamStatus,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if manager.stream_status(stream_id) == Some(expected) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stream_completes_when_source_closes() {
        let manager = EventStreamManager::new(StreamingConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = closed_source(vec![
            AgentEvent::delta("s-1", "hello"),
            AgentEvent::delta("s-1", " world"),
        ]);

        let id = manager
            .create_stream(
                source,
                StreamConfig::new("stream-1").with_handler(
                    "collector",
                    0,
                    Arc::new(Collector {
                        seen: Arc::clone(&seen),
                    }),
                ),
            )
            .unwrap();

        assert!(wait_for_status(&manager, &id, StreamStatus::Completed).await);
        assert_eq!(*seen.lock().unwrap(), vec!["hello", " world"]);
        let metrics = manager.metrics();
        assert_eq!(metrics.events_total, 2);
        assert_eq!(metrics.completed_total, 1);
        assert_eq!(metrics.active_streams, 0);
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_is_rejected() {
        let manager = EventStreamManager::new(StreamingConfig::default());
        let (_keep_alive, source) = open_source();
        manager
            .create_stream(source, StreamConfig::new("stream-1"))
            .unwrap();

        let (_keep_alive_2, other) = open_source();
        let err = manager
            .create_stream(other, StreamConfig::new("stream-1"))
            .unwrap_err();
        assert!(matches!(err, StreamError::StreamExists(_)));
        assert_eq!(manager.metrics().total_created, 1);
    }

    #[tokio::test]
    async fn test_stopped_stream_is_retained_then_swept() {
        let defaults =
            StreamingConfig::default().with_terminal_retention(Duration::from_millis(50));
        let manager = EventStreamManager::new(defaults);
        let (_keep_alive, source) = open_source();
        let id = manager
            .create_stream(source, StreamConfig::new("stream-1"))
            .unwrap();

        manager.stop_stream(&id).await.unwrap();
        assert_eq!(manager.stream_status(&id), Some(StreamStatus::Completed));
        assert_eq!(manager.cleanup_stale_streams().await, 0);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.cleanup_stale_streams().await, 1);
        assert_eq!(manager.stream_status(&id), None);
        assert_eq!(manager.metrics().removed_total, 1);
    }

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let manager = EventStreamManager::new(StreamingConfig::default());
        let (_keep_alive, source) = open_source();
        let id = manager
            .create_stream(
                source,
                StreamConfig::new("stream-1").with_timeout(Duration::from_millis(50)),
            )
            .unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.cleanup_stale_streams().await, 1);
        assert_eq!(manager.stream_status(&id), None);
        assert_eq!(manager.metrics().timed_out_total, 1);
    }

    #[tokio::test]
    async fn test_session_error_event_marks_stream_errored() {
        let manager = EventStreamManager::new(StreamingConfig::default());
        let source = closed_source(vec![
            AgentEvent::delta("s-1", "partial"),
            AgentEvent::error("s-1", "instance crashed"),
        ]);
        let id = manager
            .create_stream(source, StreamConfig::new("stream-1"))
            .unwrap();

        assert!(wait_for_status(&manager, &id, StreamStatus::Error).await);
        assert_eq!(manager.metrics().errored_total, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_refuses_new_streams() {
        let manager = EventStreamManager::new(StreamingConfig::default());
        let (_a, source_a) = open_source();
        let (_b, source_b) = open_source();
        manager
            .create_stream(source_a, StreamConfig::new("stream-a"))
            .unwrap();
        manager
            .create_stream(source_b, StreamConfig::new("stream-b"))
            .unwrap();

        manager.shutdown().await;
        manager.shutdown().await;

        let metrics = manager.metrics();
        assert_eq!(metrics.active_streams, 0);
        assert_eq!(metrics.completed_total, 2);

        let (_c, source_c) = open_source();
        let err = manager
            .create_stream(source_c, StreamConfig::new("stream-c"))
            .unwrap_err();
        assert!(matches!(err, StreamError::ShutDown));
    }
}
