//! Generic failure-accounting primitive, adapted from the Claude Code API
//! circuit breaker (closed/open/half-open with a failure window and a
//! recovery probe count) into a reusable building block for per-agent
//! liveness recovery in `AgentRegistry`.
//!
//! An API circuit breaker only ever has a timeout to go on: nothing tells it
//! the downstream service came back, so every `Open` waits out
//! `timeout_duration` and then probes blind. A crashed agent is different —
//! `AgentRegistry::heartbeat` already receives an explicit signal when the
//! agent's own process is alive again, so `HalfOpen` here waits for that
//! signal instead of firing on elapsed time alone. `timeout_duration` still
//! bounds how long to wait for it: if no heartbeat shows up within
//! `heartbeat_grace` multiples of it, the breaker probes anyway rather than
//! wedging forever on a heartbeat channel that may itself be the broken
//! part.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How many multiples of `timeout_duration` to wait for a heartbeat before
/// probing blind anyway.
const HEARTBEAT_GRACE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_duration: Duration,
    pub success_threshold: u32,
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            timeout_duration: Duration::from_secs(60),
            success_threshold: 1,
            failure_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    agent_id: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU32>,
    success_count: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
    last_state_change: Arc<RwLock<Instant>>,
    heartbeat_seen_since_open: Arc<AtomicBool>,
    total_probes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            success_count: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
            last_state_change: Arc::new(RwLock::new(Instant::now())),
            heartbeat_seen_since_open: Arc::new(AtomicBool::new(false)),
            total_probes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Called from `AgentRegistry::heartbeat` when the agent's own process
    /// reports itself alive. Lets `should_allow_probe` move to `HalfOpen`
    /// on that signal instead of on elapsed time.
    pub fn note_heartbeat(&self) {
        self.heartbeat_seen_since_open.store(true, Ordering::Relaxed);
    }

    pub async fn should_allow_probe(&self) -> bool {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        let current_state = *self.state.read().await;
        match current_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.last_state_change.read().await.elapsed();
                let heartbeat_seen = self.heartbeat_seen_since_open.load(Ordering::Relaxed);
                let grace_expired = elapsed >= self.config.timeout_duration * HEARTBEAT_GRACE;
                if (elapsed >= self.config.timeout_duration && heartbeat_seen) || grace_expired {
                    if grace_expired && !heartbeat_seen {
                        warn!(
                            agent_id = %self.agent_id,
                            "no heartbeat after {HEARTBEAT_GRACE}x timeout, probing blind"
                        );
                    }
                    self.transition_to_half_open().await;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub async fn record_success(&self) {
        let current_state = *self.state.read().await;
        match current_state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    agent_id = %self.agent_id,
                    "circuit breaker recovery probe {}/{}", count, self.config.success_threshold
                );
                if count >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                warn!(agent_id = %self.agent_id, "success recorded while circuit is open");
            }
        }
    }

    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let current_state = *self.state.read().await;
        match current_state {
            CircuitState::Closed => {
                let mut last_failure = self.last_failure_time.write().await;
                let now = Instant::now();
                if let Some(last_time) = *last_failure {
                    if now.duration_since(last_time) > self.config.failure_window {
                        self.failure_count.store(1, Ordering::Relaxed);
                    } else {
                        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if count >= self.config.failure_threshold {
                            self.transition_to_open().await;
                        }
                    }
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                }
                *last_failure = Some(now);
            }
            CircuitState::HalfOpen => {
                self.transition_to_open().await;
            }
            CircuitState::Open => {
                let mut last_failure = self.last_failure_time.write().await;
                *last_failure = Some(Instant::now());
            }
        }
    }

    async fn transition_to_open(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Open;
        *self.last_state_change.write().await = Instant::now();
        self.success_count.store(0, Ordering::Relaxed);
        self.heartbeat_seen_since_open.store(false, Ordering::Relaxed);
        warn!(agent_id = %self.agent_id, "circuit breaker opened");
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::HalfOpen;
        *self.last_state_change.write().await = Instant::now();
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        info!(agent_id = %self.agent_id, "circuit breaker entering half-open, attempting recovery probe");
    }

    async fn transition_to_closed(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        *self.last_state_change.write().await = Instant::now();
        self.failure_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        info!(agent_id = %self.agent_id, "circuit breaker closed, recovery confirmed");
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            agent_id: self.agent_id.clone(),
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            total_probes: self.total_probes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerMetrics {
    pub agent_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_probes: u64,
    pub total_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(
            "agent-1",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(
            "agent-1",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_duration: Duration::from_millis(1),
                ..Default::default()
            },
        );
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(5)).await;
        breaker.note_heartbeat();
        assert!(breaker.should_allow_probe().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn stays_open_without_heartbeat_until_grace_expires() {
        let breaker = CircuitBreaker::new(
            "agent-1",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_duration: Duration::from_millis(2),
                ..Default::default()
            },
        );
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!breaker.should_allow_probe().await);
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.should_allow_probe().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }
}
