//! Service configuration: tuning knobs for the orchestration core.
//!
//! [`ServiceConfig`] groups the static parameters that control pooling,
//! session coordination, event streaming, caching, and retry behavior in
//! [`AskService`](crate::use_cases::ask_question::AskService). These are
//! application-layer concerns, not domain policy; the on-disk configuration
//! file in the infrastructure layer maps onto this struct.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and timing for the shared agent instance pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolLimits {
    /// Maximum live instances per technology.
    pub max_per_technology: usize,
    /// Maximum live instances across all technologies.
    pub max_total: usize,
    /// Lowest port considered when spawning a new instance.
    pub base_port: u16,
    /// Maximum number of queued acquisition requests across all technologies.
    pub max_queue_size: usize,
    /// How long a queued acquisition waits before failing.
    pub queue_timeout: Duration,
    /// Idle instances older than this are evicted by the sweeper.
    pub instance_idle_timeout: Duration,
    /// How often the idle sweeper runs.
    pub sweep_interval: Duration,
    /// How many alternative ports to try when a spawn hits a port conflict.
    pub port_retry_attempts: u32,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_per_technology: 3,
            max_total: 10,
            base_port: 49152,
            max_queue_size: 50,
            queue_timeout: Duration::from_secs(30),
            instance_idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            port_retry_attempts: 8,
        }
    }
}

impl PoolLimits {
    // ==================== Builder Methods ====================

    pub fn with_max_per_technology(mut self, max: usize) -> Self {
        self.max_per_technology = max;
        self
    }

    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_instance_idle_timeout(mut self, timeout: Duration) -> Self {
        self.instance_idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Limits and timing for concurrent agent sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Maximum concurrent sessions across all technologies.
    pub max_total_sessions: usize,
    /// Maximum concurrent sessions per technology.
    pub max_sessions_per_technology: usize,
    /// A session with no activity for this long is cleaned up.
    pub idle_timeout: Duration,
    /// A pooled session is only rebound to a follow-up question within
    /// this window of its last use.
    pub reuse_window: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_total_sessions: 20,
            max_sessions_per_technology: 5,
            idle_timeout: Duration::from_secs(10 * 60),
            reuse_window: Duration::from_secs(15 * 60),
        }
    }
}

impl SessionLimits {
    // ==================== Builder Methods ====================

    pub fn with_max_total_sessions(mut self, max: usize) -> Self {
        self.max_total_sessions = max;
        self
    }

    pub fn with_max_sessions_per_technology(mut self, max: usize) -> Self {
        self.max_sessions_per_technology = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reuse_window(mut self, window: Duration) -> Self {
        self.reuse_window = window;
        self
    }
}

/// Per-stream event processor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum buffered events before the oldest is dropped.
    pub buffer_capacity: usize,
    /// Dispatch rate limit in events per second.
    pub rate_limit_per_sec: u32,
    /// Maximum handler invocations running at once.
    pub max_concurrent_handlers: usize,
    /// Buffer length at which intake pauses to let dispatch catch up.
    pub backpressure_threshold: usize,
    /// How long intake waits for the buffer to drain before force-dropping.
    pub backpressure_wait_budget: Duration,
    /// Poll interval while intake is paused.
    pub backpressure_poll_interval: Duration,
    /// How many oldest events are dropped when the wait budget is exhausted.
    pub overflow_drop_batch: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            rate_limit_per_sec: 100,
            max_concurrent_handlers: 5,
            backpressure_threshold: 800,
            backpressure_wait_budget: Duration::from_secs(5),
            backpressure_poll_interval: Duration::from_millis(50),
            overflow_drop_batch: 100,
        }
    }
}

impl ProcessorConfig {
    /// Interval between dispatch ticks. One event is pulled per tick, so a
    /// rate limit of 100/s yields a 10ms tick.
    pub fn dispatch_tick(&self) -> Duration {
        let millis = 1000 / u64::from(self.rate_limit_per_sec.max(1));
        Duration::from_millis(millis.max(1))
    }

    // ==================== Builder Methods ====================

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_rate_limit(mut self, per_sec: u32) -> Self {
        self.rate_limit_per_sec = per_sec;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    pub fn with_backpressure_threshold(mut self, threshold: usize) -> Self {
        self.backpressure_threshold = threshold;
        self
    }

    pub fn with_backpressure_wait_budget(mut self, budget: Duration) -> Self {
        self.backpressure_wait_budget = budget;
        self
    }

    pub fn with_backpressure_poll_interval(mut self, interval: Duration) -> Self {
        self.backpressure_poll_interval = interval;
        self
    }

    pub fn with_overflow_drop_batch(mut self, batch: usize) -> Self {
        self.overflow_drop_batch = batch;
        self
    }
}

/// Stream lifecycle defaults applied by the stream manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// An active stream with no events for this long is marked timed out.
    pub stream_timeout: Duration,
    /// How often the stale-stream sweeper runs.
    pub sweep_interval: Duration,
    /// How long finished streams are retained for inspection before removal.
    pub terminal_retention: Duration,
    /// Processor tuning applied to each stream.
    pub processor: ProcessorConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            terminal_retention: Duration::from_secs(60),
            processor: ProcessorConfig::default(),
        }
    }
}

impl StreamingConfig {
    // ==================== Builder Methods ====================

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = retention;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }
}

/// Event-rate throttling for interactive consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Sustained event rate (events/sec) the consumer is expected to keep up with.
    pub max_event_rate: u32,
    /// Throttling engages when the measured rate exceeds this percentage of
    /// `max_event_rate`.
    pub throttle_threshold_pct: u32,
    /// Sliding window over which the event rate is measured.
    pub rate_window: Duration,
    /// Number of degradation levels the throttle escalates through.
    pub degradation_steps: u8,
    /// Scheduler lag above this marks the consumer unresponsive.
    pub responsiveness_threshold: Duration,
    /// Whether the responsiveness probe runs at all.
    pub check_responsiveness: bool,
    /// How often the monitor re-evaluates throttle state.
    pub monitor_interval: Duration,
    /// Sleep length of the responsiveness probe.
    pub probe_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_event_rate: 100,
            throttle_threshold_pct: 80,
            rate_window: Duration::from_secs(10),
            degradation_steps: 5,
            responsiveness_threshold: Duration::from_millis(100),
            check_responsiveness: true,
            monitor_interval: Duration::from_secs(1),
            probe_interval: Duration::from_millis(100),
        }
    }
}

impl BackpressureConfig {
    // ==================== Builder Methods ====================

    pub fn with_max_event_rate(mut self, rate: u32) -> Self {
        self.max_event_rate = rate;
        self
    }

    pub fn with_throttle_threshold_pct(mut self, pct: u32) -> Self {
        self.throttle_threshold_pct = pct;
        self
    }

    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    pub fn with_degradation_steps(mut self, steps: u8) -> Self {
        self.degradation_steps = steps;
        self
    }

    pub fn with_responsiveness_threshold(mut self, threshold: Duration) -> Self {
        self.responsiveness_threshold = threshold;
        self
    }

    pub fn with_check_responsiveness(mut self, check: bool) -> Self {
        self.check_responsiveness = check;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

/// Answer cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether completed answers are cached at all.
    pub enabled: bool,
    /// Entries older than this are expired.
    pub default_ttl: Duration,
    /// A full expiry sweep runs once per this many insertions.
    pub sweep_every: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(15 * 60),
            sweep_every: 100,
        }
    }
}

impl CacheConfig {
    // ==================== Builder Methods ====================

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_every(mut self, insertions: u64) -> Self {
        self.sweep_every = insertions;
        self
    }
}

/// Exponential backoff parameters for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryParams {
    /// Retries after the first attempt, so `max_retries + 1` attempts total.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on any single inter-attempt delay.
    pub max_delay: Duration,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryParams {
    // ==================== Builder Methods ====================

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Options forwarded to every spawned agent instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Model override passed to the backend, if any.
    pub model: Option<String>,
    /// System prompt prepended to every session.
    pub system_prompt: Option<String>,
}

/// Top-level configuration for [`AskService`](crate::use_cases::ask_question::AskService).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub pool: PoolLimits,
    pub sessions: SessionLimits,
    pub streaming: StreamingConfig,
    pub backpressure: BackpressureConfig,
    pub cache: CacheConfig,
    pub retry: RetryParams,
    pub agent: AgentOptions,
    /// Upper bound on a single question's full answer stream.
    pub answer_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool: PoolLimits::default(),
            sessions: SessionLimits::default(),
            streaming: StreamingConfig::default(),
            backpressure: BackpressureConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryParams::default(),
            agent: AgentOptions::default(),
            answer_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ServiceConfig {
    // ==================== Builder Methods ====================

    pub fn with_pool(mut self, pool: PoolLimits) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionLimits) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryParams) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_agent(mut self, agent: AgentOptions) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }
}
