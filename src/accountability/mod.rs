//! Deadline-driven escalation ladder and reassignment policy (§4.8).
//! Ticked by the orchestrator's maintenance loop alongside `AgentRegistry`;
//! grounded in the same `Store`-as-source-of-truth pattern `TaskQueue` uses,
//! since a reassignment is just a task mutation plus an `Escalation` row.

use crate::event_bus::EventBus;
use crate::models::{EscalationLevel, EventPriority, StreamEvent, TaskStatus};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::{FleetError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

pub struct AccountabilityEngine {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
}

impl AccountabilityEngine {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            bus,
        }
    }

    fn ladder_level(created_at: DateTime<Utc>, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Option<EscalationLevel> {
        let window = (deadline - created_at).num_milliseconds();
        if window <= 0 {
            return None;
        }
        let overdue = (now - deadline).num_milliseconds();
        if overdue <= 0 {
            return None;
        }
        let ratio = overdue as f64 / window as f64;
        if ratio > 2.0 {
            Some(EscalationLevel::Critical)
        } else if ratio > 1.0 {
            Some(EscalationLevel::High)
        } else if ratio > 0.5 {
            Some(EscalationLevel::Medium)
        } else {
            None
        }
    }

    /// One maintenance-loop pass: scans every task with an assigned agent
    /// and a deadline, escalates per the ladder, and reassigns on the
    /// `Critical` / agent-`Crashed` rungs when a capable idle agent exists.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let in_flight = [TaskStatus::Assigned, TaskStatus::InProgress];
        for status in in_flight {
            for task in self.store.list_tasks_by_status(status)? {
                let Some(deadline) = task.deadline else {
                    continue;
                };
                let agent_crashed = match &task.assigned_agent {
                    Some(agent_id) => self
                        .registry
                        .get(agent_id)?
                        .map(|a| a.status == crate::models::AgentStatus::Crashed)
                        .unwrap_or(false),
                    None => false,
                };

                let level = if agent_crashed {
                    Some(EscalationLevel::Critical)
                } else {
                    Self::ladder_level(task.created_at, deadline, now)
                };

                let Some(level) = level else {
                    continue;
                };

                self.escalate(&task.id, task.assigned_agent.clone(), level, agent_crashed)
                    .await?;
            }
        }
        Ok(())
    }

    async fn escalate(
        &self,
        task_id: &str,
        agent_id: Option<String>,
        level: EscalationLevel,
        agent_crashed: bool,
    ) -> Result<()> {
        let escalation = crate::models::Escalation {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.clone(),
            task_id: task_id.to_string(),
            level,
            reason: if agent_crashed {
                "assigned agent crashed".to_string()
            } else {
                format!("task overdue past {} threshold", level.as_str())
            },
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.store.insert_escalation(&escalation)?;

        let priority = match level {
            EscalationLevel::Critical | EscalationLevel::SystemFailure => EventPriority::Critical,
            EscalationLevel::High => EventPriority::High,
            _ => EventPriority::Medium,
        };
        self.bus
            .publish(StreamEvent::new(
                "task.escalated",
                task_id,
                priority,
                serde_json::json!({ "task_id": task_id, "level": level.as_str() }),
            ))
            .await;

        if matches!(level, EscalationLevel::Critical) {
            self.reassign(task_id, agent_id.as_deref()).await?;
        }

        Ok(())
    }

    /// (a)-(d): requeue with `attempts++`, an `Escalation` row (already
    /// inserted by the caller), a `ReassignmentEvent`, picked up by the next
    /// scheduling tick. An agent may not be reassigned its own failed task
    /// unless `max_attempts == 1`, so single-attempt tasks are left for the
    /// same agent to retry and everything else is only checked for a
    /// *different* capable idle agent before giving up to `SystemFailure`.
    async fn reassign(&self, task_id: &str, failed_agent_id: Option<&str>) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;

        if task.max_attempts > 1 {
            if let Some(candidate) = self.registry.next_idle_agent()? {
                if Some(candidate.id.as_str()) == failed_agent_id {
                    return self.system_failure(task_id).await;
                }
                if !candidate.capabilities.contains(&task.task_type) {
                    return self.system_failure(task_id).await;
                }
            } else {
                return self.system_failure(task_id).await;
            }
        }

        self.queue.mark_failed(task_id, true).await?;
        self.bus
            .publish(StreamEvent::new(
                "task.reassigned",
                task_id,
                EventPriority::High,
                serde_json::json!({ "task_id": task_id, "previous_agent": failed_agent_id }),
            ))
            .await;
        Ok(())
    }

    async fn system_failure(&self, task_id: &str) -> Result<()> {
        warn!(task_id = %task_id, "no capable idle agent for reassignment, raising system failure");
        self.bus
            .publish(StreamEvent::new(
                "system.failure",
                task_id,
                EventPriority::Critical,
                serde_json::json!({ "task_id": task_id, "reason": "no capable idle agent available for reassignment" }),
            ))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventBusConfig, OrchestratorConfig};
    use crate::models::Task;
    use std::time::Duration;

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    fn bus(store: Arc<Store>) -> Arc<EventBus> {
        EventBus::new(
            "accountability-test",
            EventBusConfig {
                buffer_size: 32,
                flush_interval: Duration::from_secs(60),
                batch_size: 16,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
            store,
        )
    }

    fn orchestrator_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_agents: 5,
            heartbeat_interval: Duration::from_secs(1),
            timeout_threshold: Duration::from_secs(45),
            max_consecutive_failures: 3,
            max_recovery_attempts: 3,
            task_timeout: Duration::from_secs(3600),
            queue_max_size: 100,
        }
    }

    #[tokio::test]
    async fn mildly_overdue_task_only_escalates_to_medium() {
        let store = store();
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), 100));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store), orchestrator_config()));
        let event_bus = bus(Arc::clone(&store));
        let engine = AccountabilityEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            event_bus,
        );

        let now = Utc::now();
        let mut task = Task::new("t1", "code_generation", 1);
        task.created_at = now - chrono::Duration::seconds(100);
        task.deadline = Some(now - chrono::Duration::seconds(30));
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some("agent-1".to_string());
        store.put_task(&task).unwrap();

        engine.tick().await.unwrap();

        let reloaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn severely_overdue_task_without_idle_agent_raises_system_failure() {
        let store = store();
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), 100));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store), orchestrator_config()));
        let event_bus = bus(Arc::clone(&store));
        let mut rx = event_bus.subscribe("watcher").await;
        let engine = AccountabilityEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&event_bus),
        );

        let now = Utc::now();
        let mut task = Task::new("t2", "code_generation", 1);
        task.created_at = now - chrono::Duration::seconds(300);
        task.deadline = Some(now - chrono::Duration::seconds(250));
        task.max_attempts = 3;
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some("agent-1".to_string());
        store.put_task(&task).unwrap();

        engine.tick().await.unwrap();
        event_bus.flush().await;

        let batch = rx.recv().await.expect("expected an escalation batch");
        assert!(batch
            .events
            .iter()
            .any(|e| e.event_type == "system.failure"));
    }
}
