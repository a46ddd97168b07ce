//! Rate and responsiveness based throttle signal for event consumers.
//!
//! The controller watches the event arrival rate over a sliding window and
//! a synthetic scheduler-lag probe. When either crosses its threshold it
//! starts refusing events and escalates through discrete degradation
//! levels, each doubling the delay the caller is asked to honor. A monitor
//! task releases the throttle once both signals are comfortably back under
//! their thresholds.
//!
//! Every observed event lands in the window, refused ones included. The
//! window measures what the producer is doing, so a throttle under
//! sustained load stays engaged instead of releasing the moment intake
//! stops accepting.

use crate::config::BackpressureConfig;
use sage_domain::AgentEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ThrottleState {
    window: VecDeque<Instant>,
    level: u8,
    throttling: bool,
}

struct Inner {
    config: BackpressureConfig,
    state: Mutex<ThrottleState>,
    accepted: AtomicU64,
    dropped: AtomicU64,
    probe_lag_ms: AtomicU64,
    token: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureMetrics {
    pub current_rate: f64,
    pub throttling: bool,
    pub degradation_level: u8,
    pub current_delay_ms: u64,
    pub accepted_total: u64,
    pub dropped_total: u64,
    pub probe_lag_ms: u64,
}

pub struct BackpressureController {
    inner: Arc<Inner>,
}

impl BackpressureController {
    /// Creates the controller and starts its monitor task, plus the
    /// responsiveness probe when enabled. Must run inside a tokio runtime.
    pub fn new(config: BackpressureConfig) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(ThrottleState {
                window: VecDeque::new(),
                level: 0,
                throttling: false,
            }),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            probe_lag_ms: AtomicU64::new(0),
            token: CancellationToken::new(),
            config,
        });

        let monitor = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = monitor.token.cancelled() => break,
                    _ = ticker.tick() => Self::evaluate(&monitor),
                }
            }
        });

        if inner.config.check_responsiveness {
            let probe = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    let started = Instant::now();
                    tokio::select! {
                        _ = probe.token.cancelled() => break,
                        _ = tokio::time::sleep(probe.config.probe_interval) => {}
                    }
                    // Anything beyond the requested sleep is scheduler lag,
                    // a stand-in for how far behind the consumer is running.
                    let lag = started.elapsed().saturating_sub(probe.config.probe_interval);
                    probe
                        .probe_lag_ms
                        .store(lag.as_millis() as u64, Ordering::Relaxed);
                }
            });
        }

        Self { inner }
    }

    /// Records one event and reports whether the caller should process it.
    /// Returns false while throttled; the event is counted as dropped.
    pub fn process_event(&self, _event: &AgentEvent) -> bool {
        let now = Instant::now();
        let mut st = self.lock();
        Self::prune(&mut st.window, now, self.inner.config.rate_window);
        st.window.push_back(now);
        if st.throttling {
            drop(st);
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let rate = Self::rate_of(&st.window, &self.inner.config);
        if rate > Self::threshold_rate(&self.inner.config) {
            st.throttling = true;
            st.level = st.level.max(1);
            warn!(rate = format_args!("{rate:.1}"), "event rate over threshold, throttling");
        }
        drop(st);
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Delay the caller should honor before admitting more work. Zero when
    /// not throttled, otherwise doubles per degradation level.
    pub fn current_delay(&self) -> Duration {
        let st = self.lock();
        if !st.throttling {
            return Duration::ZERO;
        }
        Self::delay_for(st.level, &self.inner.config)
    }

    /// Forces the throttle on at the first degradation level.
    pub fn trigger_throttling(&self) {
        let mut st = self.lock();
        if !st.throttling {
            st.throttling = true;
            st.level = st.level.max(1);
            debug!("throttling engaged on request");
        }
    }

    /// Forces the throttle off and resets escalation.
    pub fn release(&self) {
        let mut st = self.lock();
        if st.throttling {
            st.throttling = false;
            st.level = 0;
            debug!("throttling released");
        }
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        let now = Instant::now();
        let mut st = self.lock();
        Self::prune(&mut st.window, now, self.inner.config.rate_window);
        let current_delay = if st.throttling {
            Self::delay_for(st.level, &self.inner.config)
        } else {
            Duration::ZERO
        };
        BackpressureMetrics {
            current_rate: Self::rate_of(&st.window, &self.inner.config),
            throttling: st.throttling,
            degradation_level: st.level,
            current_delay_ms: current_delay.as_millis() as u64,
            accepted_total: self.inner.accepted.load(Ordering::Relaxed),
            dropped_total: self.inner.dropped.load(Ordering::Relaxed),
            probe_lag_ms: self.inner.probe_lag_ms.load(Ordering::Relaxed),
        }
    }

    /// Stops the monitor and probe tasks. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }

    // ==================== internals ====================

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn threshold_rate(config: &BackpressureConfig) -> f64 {
        f64::from(config.max_event_rate) * f64::from(config.throttle_threshold_pct) / 100.0
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > span)
        {
            window.pop_front();
        }
    }

    fn rate_of(window: &VecDeque<Instant>, config: &BackpressureConfig) -> f64 {
        window.len() as f64 / config.rate_window.as_secs_f64().max(f64::EPSILON)
    }

    fn delay_for(level: u8, config: &BackpressureConfig) -> Duration {
        let capped = level.min(config.degradation_steps).max(1);
        let factor = 2u64.saturating_pow(u32::from(capped));
        Duration::from_millis(10u64.saturating_mul(factor))
    }

    /// One monitor tick: release when both signals are comfortably under
    /// their thresholds, otherwise escalate an engaged throttle; engage
    /// when either signal is over while idle.
    fn evaluate(inner: &Arc<Inner>) {
        let now = Instant::now();
        let config = &inner.config;
        let threshold = Self::threshold_rate(config);
        let lag_ms = inner.probe_lag_ms.load(Ordering::Relaxed);
        let responsiveness_ms = config.responsiveness_threshold.as_millis() as u64;

        let mut st = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut st.window, now, config.rate_window);
        let rate = Self::rate_of(&st.window, config);

        if st.throttling {
            let quiet = rate < threshold * 0.7;
            let responsive = !config.check_responsiveness
                || (lag_ms as f64) < responsiveness_ms as f64 * 0.8;
            if quiet && responsive {
                st.throttling = false;
                st.level = 0;
                debug!(rate = format_args!("{rate:.1}"), "backpressure released");
            } else if st.level < config.degradation_steps {
                st.level += 1;
                debug!(level = st.level, "backpressure escalated");
            }
        } else {
            let lagging = config.check_responsiveness && lag_ms > responsiveness_ms;
            if rate > threshold || lagging {
                st.throttling = true;
                st.level = st.level.max(1);
                warn!(
                    rate = format_args!("{rate:.1}"),
                    lag_ms, "consumer falling behind, throttling"
                );
            }
        }
    }
}

impl Drop for BackpressureController {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}
