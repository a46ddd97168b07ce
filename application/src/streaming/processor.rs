//! Buffered, prioritized, rate-limited event dispatch.
//!
//! The processor sits between an instance's raw event feed and the
//! registered handlers. Intake buffers events with drop-oldest overflow
//! and a pause-then-shed backpressure stage; an independent dispatch task
//! pulls at most one event per tick and fans it out to every matching
//! handler, lowest priority number first, each on its own task.
//!
//! Events no registered handler matches are left in the buffer. They are
//! never dispatched and eventually fall out through overflow, which keeps
//! an unknown event type from wedging the stream.

use crate::config::ProcessorConfig;
use crate::ports::agent_gateway::EventSubscription;
use crate::streaming::handler::{EventHandler, HandlerRegistration};
use sage_domain::AgentEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("handler '{0}' is already registered")]
    HandlerExists(String),

    #[error("event processor is shut down")]
    ShutDown,
}

struct ProcState {
    buffer: VecDeque<AgentEvent>,
    handlers: Vec<HandlerRegistration>,
}

struct Shared {
    config: ProcessorConfig,
    state: Mutex<ProcState>,
    running: AtomicUsize,
    processed: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
    /// Signaled whenever a handler finishes or the handler set shrinks, so
    /// intake pauses and drain waits wake up promptly.
    work_done: Notify,
    token: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorMetrics {
    pub buffered_events: usize,
    pub running_handlers: usize,
    pub registered_handlers: usize,
    pub processed_total: u64,
    pub dropped_total: u64,
    pub handler_errors: u64,
}

pub struct EventProcessor {
    shared: Arc<Shared>,
}

impl EventProcessor {
    /// Creates the processor and starts its dispatch task. Must run inside
    /// a tokio runtime. Dispatch keeps running until [`shutdown`], so
    /// handlers registered after a stream finishes still drain whatever
    /// the buffer holds.
    ///
    /// [`shutdown`]: EventProcessor::shutdown
    pub fn new(config: ProcessorConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ProcState {
                buffer: VecDeque::new(),
                handlers: Vec::new(),
            }),
            running: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            work_done: Notify::new(),
            token: CancellationToken::new(),
            config,
        });
        let dispatch = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatch.config.dispatch_tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dispatch.token.cancelled() => break,
                    _ = ticker.tick() => Self::dispatch_next(&dispatch),
                }
            }
        });
        Self { shared }
    }

    /// Registers a handler under a unique name. Lower priority numbers are
    /// dispatched first.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ProcessorError> {
        if self.shared.token.is_cancelled() {
            return Err(ProcessorError::ShutDown);
        }
        let name = name.into();
        let mut st = self.lock();
        if st.handlers.iter().any(|r| r.name == name) {
            return Err(ProcessorError::HandlerExists(name));
        }
        debug!(handler = %name, priority, "handler registered");
        st.handlers.push(HandlerRegistration::new(name, priority, handler));
        Ok(())
    }

    /// Removes a handler. Returns whether it was registered.
    pub fn unregister_handler(&self, name: &str) -> bool {
        let removed = {
            let mut st = self.lock();
            let before = st.handlers.len();
            st.handlers.retain(|r| r.name != name);
            st.handlers.len() < before
        };
        if removed {
            debug!(handler = %name, "handler unregistered");
            // Buffered events may have just become unmatchable, which can
            // complete a drain wait.
            self.shared.work_done.notify_waiters();
        }
        removed
    }

    /// Consumes a source until it closes, then waits for dispatch to
    /// drain. Returns early when the processor is shut down mid-stream.
    pub async fn process_event_stream(
        &self,
        mut source: EventSubscription,
    ) -> Result<(), ProcessorError> {
        if self.shared.token.is_cancelled() {
            return Err(ProcessorError::ShutDown);
        }
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shared.token.cancelled() => return Ok(()),
                event = source.next_event() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if !self.admit(event).await {
                return Ok(());
            }
        }
        self.drain().await;
        Ok(())
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        let st = self.lock();
        ProcessorMetrics {
            buffered_events: st.buffer.len(),
            registered_handlers: st.handlers.len(),
            running_handlers: self.shared.running.load(Ordering::Acquire),
            processed_total: self.shared.processed.load(Ordering::Relaxed),
            dropped_total: self.shared.dropped.load(Ordering::Relaxed),
            handler_errors: self.shared.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Stops dispatch, waits for in-flight handlers, and clears all state.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shared.token.cancel();
        while self.shared.running.load(Ordering::Acquire) > 0 {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.work_done.notified(),
            )
            .await;
        }
        let mut st = self.lock();
        st.buffer.clear();
        st.handlers.clear();
    }

    // ==================== internals ====================

    fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One dispatch tick: pick the buffered event whose best handler has
    /// the lowest priority number (ties broken by buffer order) and fan it
    /// out to every matching handler.
    fn dispatch_next(shared: &Arc<Shared>) {
        if shared.running.load(Ordering::Acquire) >= shared.config.max_concurrent_handlers {
            return;
        }
        let picked = {
            let mut st = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            Self::select_event(&mut st)
        };
        let Some((event, matching)) = picked else {
            return;
        };
        shared.processed.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);
        for registration in matching {
            shared.running.fetch_add(1, Ordering::AcqRel);
            let shared = Arc::clone(shared);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = registration.handler.handle(&event).await {
                    shared.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = %registration.name,
                        event = %event.event_type,
                        "event handler failed: {e}"
                    );
                }
                shared.running.fetch_sub(1, Ordering::AcqRel);
                shared.work_done.notify_waiters();
            });
        }
    }

    fn select_event(st: &mut ProcState) -> Option<(AgentEvent, Vec<HandlerRegistration>)> {
        let mut best: Option<(i32, usize)> = None;
        for (idx, event) in st.buffer.iter().enumerate() {
            let mut lowest: Option<i32> = None;
            for registration in &st.handlers {
                if registration.handler.can_handle(event) {
                    lowest =
                        Some(lowest.map_or(registration.priority, |p| p.min(registration.priority)));
                }
            }
            if let Some(priority) = lowest
                && best.is_none_or(|(bp, _)| priority < bp)
            {
                best = Some((priority, idx));
            }
        }
        let (_, idx) = best?;
        let event = st.buffer.remove(idx)?;
        let mut matching: Vec<HandlerRegistration> = st
            .handlers
            .iter()
            .filter(|r| r.handler.can_handle(&event))
            .cloned()
            .collect();
        // Stable sort keeps registration order within a priority.
        matching.sort_by_key(|r| r.priority);
        Some((event, matching))
    }

    /// Buffers one event, pausing first when the buffer is over the
    /// backpressure threshold. Returns false when shut down while waiting.
    async fn admit(&self, event: AgentEvent) -> bool {
        let config = &self.shared.config;
        let threshold = config.backpressure_threshold;
        let resume_at = threshold * 4 / 5;
        let mut deadline: Option<Instant> = None;

        loop {
            let len = self.lock().buffer.len();
            match deadline {
                None => {
                    if len < threshold {
                        break;
                    }
                    deadline = Some(Instant::now() + config.backpressure_wait_budget);
                    debug!(buffered = len, "intake paused for backpressure");
                }
                Some(_) if len <= resume_at => {
                    debug!(buffered = len, "intake resumed");
                    break;
                }
                Some(d) if Instant::now() >= d => {
                    let dropped = {
                        let mut st = self.lock();
                        let n = config.overflow_drop_batch.min(st.buffer.len());
                        st.buffer.drain(..n);
                        n
                    };
                    self.shared
                        .dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    warn!(dropped, "backpressure wait budget exhausted, dropped oldest events");
                    break;
                }
                Some(_) => {}
            }
            tokio::select! {
                _ = self.shared.token.cancelled() => return false,
                _ = tokio::time::sleep(config.backpressure_poll_interval) => {}
                _ = self.shared.work_done.notified() => {}
            }
        }

        let mut st = self.lock();
        if st.buffer.len() >= config.buffer_capacity {
            st.buffer.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        st.buffer.push_back(event);
        true
    }

    /// Waits until nothing dispatchable remains: no handler running and no
    /// buffered event any handler matches.
    async fn drain(&self) {
        loop {
            if self.is_drained() {
                return;
            }
            tokio::select! {
                _ = self.shared.token.cancelled() => return,
                _ = tokio::time::timeout(
                    Duration::from_millis(100),
                    self.shared.work_done.notified(),
                ) => {}
            }
        }
    }

    fn is_drained(&self) -> bool {
        if self.shared.running.load(Ordering::Acquire) > 0 {
            return false;
        }
        let st = self.lock();
        !st.buffer
            .iter()
            .any(|event| st.handlers.iter().any(|r| r.handler.can_handle(event)))
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}
