//! Ask use case.
//!
//! Orchestrates one question end to end:
//! 1. Resolve the technology against the catalog
//! 2. Serve from the answer cache when possible
//! 3. Acquire an instance and a session (reused or fresh), under admission
//!    control and retry
//! 4. Stream events back to the caller while a parallel collector builds
//!    the cacheable answer
//! 5. Settle on the terminal event: park the session, release the lease,
//!    cache and log the answer
//!
//! The returned [`AnswerStream`] closes once the answer's stream is torn
//! down; all settlement happens before that, so a caller that drained the
//! stream observes the pool and cache in their settled state.

use crate::cache::{CacheMetrics, ResponseCache};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::pool::{
    AcquiredInstance, CoordinatorMetrics, InstanceLease, PoolMetrics, PooledSession,
    ResourcePool, SessionCoordinator, SessionInfo, SessionPool, SessionPoolMetrics,
};
use crate::ports::agent_gateway::{AgentGateway, EventSubscription, InstanceConfig};
use crate::ports::catalog::{TechnologyCatalog, TechnologyEntry};
use crate::ports::query_log::{NoQueryLogger, QueryLogger, QueryRecord};
use crate::retry::retry_with_backoff;
use crate::streaming::{
    EventHandler, EventStreamManager, HandlerError, StreamConfig, StreamError,
    StreamManagerMetrics,
};
use async_trait::async_trait;
use sage_domain::{AgentEvent, Question, Technology, event_types};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Events of one answer, in arrival order, ending when the stream is torn
/// down. Dropping the stream early is fine; settlement does not depend on
/// the caller draining it.
#[derive(Debug)]
pub struct AnswerStream {
    session_id: String,
    receiver: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AnswerStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.receiver.recv().await
    }

    /// Drains the stream into the answer text. Deltas are concatenated;
    /// when none arrived, a full assistant message stands in. A session
    /// error ends the stream with [`ServiceError::SessionFailed`].
    pub async fn collect_text(mut self) -> Result<String, ServiceError> {
        let mut text = String::new();
        let mut full_message: Option<String> = None;
        while let Some(event) = self.receiver.recv().await {
            if let Some(message) = event.error_message() {
                return Err(ServiceError::SessionFailed(message.to_string()));
            }
            match event.event_type.as_str() {
                event_types::ASSISTANT_DELTA => {
                    if let Some(chunk) = event.content() {
                        text.push_str(chunk);
                    }
                }
                event_types::ASSISTANT_MESSAGE => {
                    if let Some(content) = event.content() {
                        full_message = Some(content.to_string());
                    }
                }
                _ => {}
            }
        }
        if text.is_empty()
            && let Some(full) = full_message
        {
            return Ok(full);
        }
        Ok(text)
    }
}

/// Combined snapshot across every subsystem the service owns.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub pool: PoolMetrics,
    pub sessions: CoordinatorMetrics,
    pub session_pool: SessionPoolMetrics,
    pub cache: CacheMetrics,
    pub streams: StreamManagerMetrics,
}

/// Everything a successful session start hands back to the ask flow.
struct SessionStart {
    instance: AcquiredInstance,
    session_id: String,
    subscription: EventSubscription,
    reused_session: bool,
}

/// State the finalize watcher needs once the answer stream is live.
struct FinalizeJob {
    stream_id: String,
    session_id: String,
    technology: Technology,
    question: Question,
    lease: InstanceLease,
    instance_id: u64,
    reused_session: bool,
    collected: Arc<Mutex<Vec<AgentEvent>>>,
    done_rx: oneshot::Receiver<Result<(), String>>,
    started: Instant,
}

/// Forwards one session's events to the caller and reports the terminal
/// event. Runs before every other handler so the caller sees events first.
struct ForwardHandler {
    session_id: String,
    sender: mpsc::UnboundedSender<AgentEvent>,
    done: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

#[async_trait]
impl EventHandler for ForwardHandler {
    fn can_handle(&self, event: &AgentEvent) -> bool {
        event.session_id() == Some(self.session_id.as_str())
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        let failure = event.error_message().map(str::to_string);
        let terminal = event.is_terminal();
        // A closed receiver just means the caller stopped listening.
        let _ = self.sender.send(event.clone());
        if terminal
            && let Some(done) = self
                .done
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        {
            let _ = done.send(match failure {
                Some(message) => Err(message),
                None => Ok(()),
            });
        }
        Ok(())
    }
}

/// Accumulates one session's events for the answer cache.
struct CollectHandler {
    session_id: String,
    events: Arc<Mutex<Vec<AgentEvent>>>,
}

#[async_trait]
impl EventHandler for CollectHandler {
    fn can_handle(&self, event: &AgentEvent) -> bool {
        event.session_id() == Some(self.session_id.as_str())
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Front door of the service: owns the pool, coordinator, session pool,
/// stream manager, and cache, and wires one question through all of them.
pub struct AskService {
    catalog: Arc<dyn TechnologyCatalog>,
    pool: Arc<ResourcePool>,
    coordinator: Arc<SessionCoordinator>,
    session_pool: Arc<SessionPool>,
    streams: Arc<EventStreamManager>,
    cache: Arc<ResponseCache<Vec<AgentEvent>>>,
    query_log: Arc<dyn QueryLogger>,
    config: ServiceConfig,
    ask_seq: AtomicU64,
    shutting_down: AtomicBool,
}

impl AskService {
    /// Builds the service and every subsystem it owns. Must run inside a
    /// tokio runtime; the pool and stream manager start sweep tasks.
    pub fn new(
        gateway: Arc<dyn AgentGateway>,
        catalog: Arc<dyn TechnologyCatalog>,
        config: ServiceConfig,
    ) -> Self {
        let pool = Arc::new(ResourcePool::new(gateway, config.pool.clone()));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&pool),
            config.sessions.clone(),
        ));
        Self {
            catalog,
            coordinator,
            session_pool: Arc::new(SessionPool::new(config.sessions.reuse_window)),
            streams: Arc::new(EventStreamManager::new(config.streaming.clone())),
            cache: Arc::new(ResponseCache::new(config.cache.clone())),
            query_log: Arc::new(NoQueryLogger),
            pool,
            config,
            ask_seq: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Replaces the default no-op query logger.
    pub fn with_query_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.query_log = logger;
        self
    }

    /// Asks `question` against `technology` and returns the live answer
    /// stream. The heavy lifting happens on background tasks; this returns
    /// as soon as the prompt is accepted.
    pub async fn ask_question(
        &self,
        technology: &str,
        question: &str,
    ) -> Result<AnswerStream, ServiceError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ServiceError::ShuttingDown);
        }
        let question = Question::parse(question)?;
        let entry = self.catalog.resolve(technology)?;
        let tech = Technology::new(entry.name.clone());
        let started = Instant::now();

        if let Some(events) = self.cache.get(&tech, &question, None) {
            info!(technology = %tech, "answer served from cache");
            return Ok(self.replay_cached(&tech, &question, events, started));
        }

        let instance_config = InstanceConfig {
            technology: tech.clone(),
            repo_path: entry.repo_path.clone(),
            model: self.config.agent.model.clone(),
            system_prompt: self.config.agent.system_prompt.clone(),
        };
        let start = retry_with_backoff(
            &self.config.retry,
            |_attempt| self.begin_session(&tech, &question, &instance_config),
            ServiceError::is_retryable,
        )
        .await?;
        let SessionStart {
            instance,
            session_id,
            subscription,
            reused_session,
        } = start;

        // The timer callback retires the parked session so an
        // idle-expired session cannot be checked out again.
        {
            let session_pool = Arc::clone(&self.session_pool);
            let sid = session_id.clone();
            self.coordinator.set_session_timeout(
                &session_id,
                self.config.sessions.idle_timeout,
                Some(Box::new(move || {
                    session_pool.mark_inactive(&sid);
                })),
            );
        }

        // Reused sessions get a fresh stream id per ask; a terminal stream
        // for the same session may still be in its retention window.
        let seq = self.ask_seq.fetch_add(1, Ordering::Relaxed);
        let stream_id = format!("{session_id}#{seq}");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let collected: Arc<Mutex<Vec<AgentEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let stream_config = StreamConfig::new(stream_id.clone())
            .with_processor(self.config.streaming.processor.clone())
            .with_handler(
                "forward",
                -10,
                Arc::new(ForwardHandler {
                    session_id: session_id.clone(),
                    sender: event_tx,
                    done: Mutex::new(Some(done_tx)),
                }),
            )
            .with_handler(
                "collect",
                50,
                Arc::new(CollectHandler {
                    session_id: session_id.clone(),
                    events: Arc::clone(&collected),
                }),
            );
        if let Err(e) = self.streams.create_stream(subscription, stream_config) {
            self.session_pool.remove(&session_id);
            self.coordinator.cleanup_session(&session_id);
            return Err(ServiceError::Stream(e.to_string()));
        }

        self.spawn_finalizer(FinalizeJob {
            stream_id,
            session_id: session_id.clone(),
            technology: tech,
            question,
            lease: instance.lease.clone(),
            instance_id: instance.handle.id(),
            reused_session,
            collected,
            done_rx,
            started,
        });

        info!(session = %session_id, reused = reused_session, "question dispatched");
        Ok(AnswerStream {
            session_id,
            receiver: event_rx,
        })
    }

    pub fn list_technologies(&self) -> Vec<TechnologyEntry> {
        self.catalog.list()
    }

    pub fn metrics(&self) -> ServiceMetrics {
        ServiceMetrics {
            pool: self.pool.metrics(),
            sessions: self.coordinator.metrics(),
            session_pool: self.session_pool.metrics(),
            cache: self.cache.metrics(),
            streams: self.streams.metrics(),
        }
    }

    /// Stops accepting questions and tears down streams, sessions, and
    /// instances. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("service shutting down");
        self.streams.shutdown().await;
        self.coordinator.shutdown();
        self.pool.shutdown().await;
        self.session_pool.clear();
    }

    // ==================== internals ====================

    /// One attempt at getting a live session with the prompt sent. Called
    /// under the retry policy; any failure after registration cleans up
    /// so a retry starts from scratch.
    async fn begin_session(
        &self,
        technology: &Technology,
        question: &Question,
        instance_config: &InstanceConfig,
    ) -> Result<SessionStart, ServiceError> {
        let key = technology.key();
        let admission = self.coordinator.can_create_session(&key);
        if !admission.allowed {
            let reason = admission
                .reason
                .unwrap_or_else(|| "session limit reached".to_string());
            return Err(ServiceError::SessionLimit(reason));
        }

        let instance = self.pool.acquire(technology, instance_config).await?;
        let instance_id = instance.handle.id();

        let (session_id, reused_session) = match self.session_pool.checkout(&key, instance_id) {
            Some(pooled) => {
                debug!(
                    session = %pooled.session_id,
                    instance = instance_id,
                    "reusing pooled session"
                );
                (pooled.session_id, true)
            }
            None => match instance.handle.transport().create_session().await {
                Ok(session_id) => (session_id, false),
                Err(e) => {
                    self.pool.release(&instance.lease);
                    return Err(ServiceError::Gateway(e));
                }
            },
        };

        self.coordinator.register_session(SessionInfo {
            session_id: session_id.clone(),
            technology: key,
            lease: instance.lease.clone(),
        });

        // Subscribe before the prompt goes out so no early event is lost.
        // On failure the subscription is simply dropped.
        let subscription = instance.handle.transport().subscribe_events();
        if let Err(e) = instance
            .handle
            .transport()
            .send_prompt(&session_id, question.content())
            .await
        {
            self.session_pool.remove(&session_id);
            self.coordinator.cleanup_session(&session_id);
            return Err(ServiceError::Gateway(e));
        }

        Ok(SessionStart {
            instance,
            session_id,
            subscription,
            reused_session,
        })
    }

    /// Watches for the answer's terminal event and settles everything the
    /// ask borrowed: session, lease, cache entry, query log, stream.
    fn spawn_finalizer(&self, job: FinalizeJob) {
        let pool = Arc::clone(&self.pool);
        let coordinator = Arc::clone(&self.coordinator);
        let session_pool = Arc::clone(&self.session_pool);
        let streams = Arc::clone(&self.streams);
        let cache = Arc::clone(&self.cache);
        let query_log = Arc::clone(&self.query_log);
        let answer_timeout = self.config.answer_timeout;

        tokio::spawn(async move {
            let FinalizeJob {
                stream_id,
                session_id,
                technology,
                question,
                lease,
                instance_id,
                reused_session,
                collected,
                done_rx,
                started,
            } = job;
            let mut record = QueryRecord::new(technology.key(), question.content());
            record.session_reused = reused_session;

            match tokio::time::timeout(answer_timeout, done_rx).await {
                Ok(Ok(Ok(()))) => {
                    let events = collected
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    record.events = events.len() as u64;
                    record.answer_chars = answer_chars(&events);
                    let now = Instant::now();
                    session_pool.offer(PooledSession {
                        session_id: session_id.clone(),
                        technology: technology.key(),
                        instance_id,
                        created_at: now,
                        last_used: now,
                        is_active: true,
                    });
                    coordinator.update_session_activity(&session_id);
                    pool.release(&lease);
                    cache.set(&technology, &question, None, events, None);
                    debug!(session = %session_id, "answer finished, instance released");
                }
                Ok(Ok(Err(message))) => {
                    warn!(session = %session_id, error = %message, "session reported failure");
                    record.error = Some(message);
                    session_pool.remove(&session_id);
                    coordinator.cleanup_session(&session_id);
                }
                Ok(Err(_)) => {
                    debug!(session = %session_id, "stream torn down before a terminal event");
                    record.error = Some("stream closed before completion".to_string());
                    session_pool.remove(&session_id);
                    coordinator.cleanup_session(&session_id);
                }
                Err(_) => {
                    warn!(session = %session_id, "no terminal event within answer timeout");
                    record.error = Some("answer timed out".to_string());
                    session_pool.remove(&session_id);
                    coordinator.cleanup_session(&session_id);
                }
            }
            record.duration_ms = started.elapsed().as_millis() as u64;
            query_log.log(record);

            // Closes the forwarder, which ends the caller's stream.
            if let Err(e) = streams.stop_stream(&stream_id).await
                && !matches!(e, StreamError::StreamNotFound(_))
            {
                debug!("post-answer stream stop: {e}");
            }
        });
    }

    /// Replays a cached answer through a fresh channel and logs the hit.
    fn replay_cached(
        &self,
        technology: &Technology,
        question: &Question,
        events: Vec<AgentEvent>,
        started: Instant,
    ) -> AnswerStream {
        let session_id = events
            .iter()
            .find_map(|e| e.session_id().map(str::to_string))
            .unwrap_or_else(|| "cached".to_string());
        let mut record = QueryRecord::new(technology.key(), question.content());
        record.cached = true;
        record.events = events.len() as u64;
        record.answer_chars = answer_chars(&events);
        record.duration_ms = started.elapsed().as_millis() as u64;

        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        self.query_log.log(record);
        AnswerStream {
            session_id,
            receiver: rx,
        }
    }
}

fn answer_chars(events: &[AgentEvent]) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == event_types::ASSISTANT_DELTA)
        .filter_map(|e| e.content())
        .map(str::len)
        .sum()
}
