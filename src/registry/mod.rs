//! Agent registration, heartbeats, liveness probing, crash detection and
//! the sleep/wake memory-snapshot protocol (§4.4). Generalizes the
//! teacher's `agent_registry.rs`/`status_manager.rs` pair — which track a
//! fixed set of built-in agent types — into a dynamic, capability-indexed
//! registry of opaque transports, with per-agent recovery state borrowed
//! from the Claude Code circuit breaker.

pub mod circuit_breaker;

use crate::agent::{Agent, ProbeOutcome};
use crate::config::OrchestratorConfig;
use crate::event_bus::EventBus;
use crate::models::{AgentRecord, AgentStatus, EventPriority, MemorySnapshot, SnapshotKind, StreamEvent};
use crate::store::Store;
use crate::{FleetError, Result};
use chrono::Utc;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct AgentRegistry {
    store: Arc<Store>,
    config: OrchestratorConfig,
    transports: Mutex<HashMap<String, Arc<dyn Agent>>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<Store>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            config,
            transports: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        capabilities: std::collections::HashSet<String>,
        transport: Arc<dyn Agent>,
    ) -> Result<()> {
        let id = transport.id().to_string();
        let mut record = AgentRecord::new(id.clone(), capabilities);
        record.status = AgentStatus::Idle;
        self.store.put_agent(&record)?;

        self.transports.lock().await.insert(id.clone(), transport);
        self.breakers.lock().await.insert(
            id.clone(),
            CircuitBreaker::new(
                id,
                CircuitBreakerConfig {
                    failure_threshold: self.config.max_consecutive_failures,
                    ..Default::default()
                },
            ),
        );
        Ok(())
    }

    pub fn heartbeat(&self, id: &str, working_memory: Option<Vec<u8>>) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)?
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        agent.last_heartbeat = Utc::now();
        agent.consecutive_failures = 0;
        if agent.status == AgentStatus::Recovering || agent.status == AgentStatus::Timeout {
            agent.status = AgentStatus::Running;
            agent.recovery_attempts = 0;
        }
        if let Ok(breakers) = self.breakers.try_lock() {
            if let Some(breaker) = breakers.get(id) {
                breaker.note_heartbeat();
            }
        }
        if let Some(memory) = working_memory {
            agent.metadata.insert(
                "working_memory_len".to_string(),
                memory.len().to_string(),
            );
        }
        self.store.put_agent(&agent)?;
        Ok(())
    }

    /// First agent in `{Idle, Running}` with no current task. The queue
    /// re-checks capability match on `Next`; the registry only reports
    /// availability.
    pub fn next_idle_agent(&self) -> Result<Option<AgentRecord>> {
        let agents = self.store.list_agents()?;
        Ok(agents.into_iter().find(|a| {
            matches!(a.status, AgentStatus::Idle | AgentStatus::Running) && a.current_task_id.is_none()
        }))
    }

    pub fn mark_running(&self, id: &str, task_id: &str) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)?
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        agent.status = AgentStatus::Running;
        agent.current_task_id = Some(task_id.to_string());
        self.store.put_agent(&agent)?;
        Ok(())
    }

    pub fn mark_idle(&self, id: &str) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)?
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        agent.status = AgentStatus::Idle;
        agent.current_task_id = None;
        self.store.put_agent(&agent)?;
        Ok(())
    }

    pub async fn sleep(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)?
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        let snapshot = MemorySnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            agent_id: id.to_string(),
            kind: SnapshotKind::Sleep,
            payload,
            created_at: Utc::now(),
        };
        self.store.put_snapshot(&snapshot)?;
        agent.status = AgentStatus::Sleeping;
        self.store.put_agent(&agent)?;
        Ok(())
    }

    pub async fn wake(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let mut agent = self
            .store
            .get_agent(id)?
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        let snapshot = self.store.latest_snapshot(id)?;
        agent.status = AgentStatus::Running;
        self.store.put_agent(&agent)?;
        Ok(snapshot.map(|s| s.payload))
    }

    /// Runs one liveness tick: probes every registered transport, updates
    /// heartbeat-timeout and consecutive-failure state, and drives recovery.
    /// Returns events for the caller to publish (kept out-of-band so the
    /// registry doesn't need a handle to the bus at construction time, but
    /// callers typically pass the orchestrator's bus directly via `tick`).
    pub async fn tick(&self, bus: &Arc<EventBus>) -> Result<()> {
        let transports: Vec<(String, Arc<dyn Agent>)> = self
            .transports
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        for (id, transport) in transports {
            self.tick_one(&id, transport.as_ref(), bus).await?;
        }
        Ok(())
    }

    async fn tick_one(&self, id: &str, transport: &dyn Agent, bus: &Arc<EventBus>) -> Result<()> {
        let mut agent = match self.store.get_agent(id)? {
            Some(a) => a,
            None => return Ok(()),
        };
        if matches!(agent.status, AgentStatus::Sleeping | AgentStatus::Terminated | AgentStatus::Crashed) {
            return Ok(());
        }

        let breakers = self.breakers.lock().await;
        let breaker = breakers.get(id);
        let allow_probe = match breaker {
            Some(b) => b.should_allow_probe().await,
            None => true,
        };
        if !allow_probe {
            return Ok(());
        }

        let outcome = transport.probe().await;
        match outcome {
            ProbeOutcome::Alive => {
                if let Some(b) = breaker {
                    b.record_success().await;
                }
                agent.consecutive_failures = 0;
                if agent.status == AgentStatus::Timeout || agent.status == AgentStatus::Recovering {
                    // The probe answering doesn't mean the session behind it
                    // is sane; tear it down and relaunch before trusting it
                    // with work again.
                    if let Err(e) = transport.shutdown().await {
                        warn!(agent_id = %id, "shutdown before restart failed: {e}");
                    }
                    match transport.restart().await {
                        Ok(()) => {
                            agent.status = AgentStatus::Running;
                            agent.recovery_attempts = 0;
                            bus.publish(StreamEvent::new(
                                "agent.recovered",
                                id,
                                EventPriority::Medium,
                                serde_json::json!({ "agent_id": id }),
                            ))
                            .await;
                            info!(agent_id = %id, "agent recovered");
                        }
                        Err(e) => {
                            warn!(agent_id = %id, "restart failed during recovery: {e}");
                            agent.recovery_attempts += 1;
                            if agent.recovery_attempts > self.config.max_recovery_attempts {
                                agent.status = AgentStatus::Crashed;
                                bus.publish(StreamEvent::new(
                                    "agent.crashed",
                                    id,
                                    EventPriority::Critical,
                                    serde_json::json!({ "agent_id": id, "reason": "restart exhausted recovery attempts" }),
                                ))
                                .await;
                            }
                        }
                    }
                }
            }
            ProbeOutcome::Unresponsive => {
                if let Some(b) = breaker {
                    b.record_failure().await;
                }
                agent.consecutive_failures += 1;
            }
        }

        let now = Utc::now();
        if (now - agent.last_heartbeat).num_seconds()
            > self.config.timeout_threshold.as_secs() as i64
            && agent.status != AgentStatus::Timeout
            && agent.status != AgentStatus::Crashed
        {
            agent.status = AgentStatus::Timeout;
            agent.recovery_attempts += 1;
            warn!(agent_id = %id, "agent heartbeat timed out");

            if agent.recovery_attempts > self.config.max_recovery_attempts {
                agent.status = AgentStatus::Crashed;
                bus.publish(StreamEvent::new(
                    "agent.crashed",
                    id,
                    EventPriority::Critical,
                    serde_json::json!({ "agent_id": id, "reason": "recovery attempts exhausted" }),
                ))
                .await;
                warn!(agent_id = %id, "agent exhausted recovery attempts, marking crashed");
            } else {
                agent.status = AgentStatus::Recovering;
            }
        }

        if agent.consecutive_failures >= self.config.max_consecutive_failures
            && agent.status != AgentStatus::Crashed
        {
            agent.status = AgentStatus::Crashed;
            bus.publish(StreamEvent::new(
                "agent.crashed",
                id,
                EventPriority::Critical,
                serde_json::json!({ "agent_id": id, "reason": "consecutive failures" }),
            ))
            .await;
        }

        self.store.put_agent(&agent)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        self.store.get_agent(id)
    }

    pub fn list(&self) -> Result<Vec<AgentRecord>> {
        self.store.list_agents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::config::EventBusConfig;
    use std::collections::HashSet;
    use std::time::Duration;

    fn orchestrator_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_agents: 10,
            heartbeat_interval: Duration::from_secs(1),
            timeout_threshold: Duration::from_millis(0),
            max_consecutive_failures: 2,
            max_recovery_attempts: 1,
            task_timeout: Duration::from_secs(60),
            queue_max_size: 100,
        }
    }

    fn bus(store: Arc<Store>) -> Arc<EventBus> {
        EventBus::new(
            "test",
            EventBusConfig {
                buffer_size: 16,
                flush_interval: Duration::from_secs(60),
                batch_size: 8,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
            store,
        )
    }

    #[tokio::test]
    async fn sleep_then_wake_round_trips_payload() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = AgentRegistry::new(Arc::clone(&store), orchestrator_config());
        let transport = Arc::new(MockAgent::new("a1"));
        registry
            .register(HashSet::from(["code_generation".to_string()]), transport)
            .await
            .unwrap();

        registry.sleep("a1", b"snapshot-data".to_vec()).await.unwrap();
        let agent = registry.get("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Sleeping);

        let woken = registry.wake("a1").await.unwrap();
        assert_eq!(woken, Some(b"snapshot-data".to_vec()));
        let agent = registry.get("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn repeated_probe_failures_mark_agent_crashed() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = AgentRegistry::new(Arc::clone(&store), orchestrator_config());
        let transport = Arc::new(MockAgent::new("a1"));
        *transport.fail_probe.lock().await = true;
        registry
            .register(HashSet::from(["code_generation".to_string()]), transport)
            .await
            .unwrap();
        let event_bus = bus(Arc::clone(&store));

        for _ in 0..3 {
            registry.tick(&event_bus).await.unwrap();
        }
        let agent = registry.get("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Crashed);
    }

    #[tokio::test]
    async fn heartbeat_clears_recovering_state() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = AgentRegistry::new(Arc::clone(&store), orchestrator_config());
        let transport = Arc::new(MockAgent::new("a1"));
        registry
            .register(HashSet::from(["code_generation".to_string()]), transport)
            .await
            .unwrap();
        let mut agent = registry.get("a1").unwrap().unwrap();
        agent.status = AgentStatus::Recovering;
        store.put_agent(&agent).unwrap();

        registry.heartbeat("a1", None).unwrap();
        let agent = registry.get("a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
    }
}
