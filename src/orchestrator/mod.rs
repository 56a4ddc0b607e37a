//! Top-level scheduling and maintenance loops (§4.9). Wires every other
//! component together; mirrors the teacher's `main.rs` top-level task that
//! `tokio::select!`s between a Discord gateway loop and an HTTP server, here
//! generalized to two named, channel-communicating loops per the design
//! note's `agent_reports`/`shutdown`/`heartbeat_ticks` channel split.

use crate::accountability::AccountabilityEngine;
use crate::agent::{Agent, AgentReport, AgentReportKind, DispatchOutcome};
use crate::config::OrchestratorConfig;
use crate::confidence::ConfidenceTracker;
use crate::event_bus::EventBus;
use crate::models::{AgentRecord, Artifact, Decision, EventPriority, Outcome, StreamEvent, Task, TaskStatus};
use crate::quality::{GateDecision, QualityGate};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::vcs::pr_integrator::PRIntegrator;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

const IDLE_SLEEP: Duration = Duration::from_millis(200);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);
const DECISION_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DECISION_RETENTION_DAYS: i64 = 30;

pub struct Orchestrator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    confidence: Arc<ConfidenceTracker>,
    gate: Arc<QualityGate>,
    pr_integrator: Option<Arc<PRIntegrator>>,
    accountability: Arc<AccountabilityEngine>,
    config: OrchestratorConfig,
    report_tx: mpsc::UnboundedSender<AgentReport>,
    report_rx: Mutex<mpsc::UnboundedReceiver<AgentReport>>,
    transports: Mutex<std::collections::HashMap<String, Arc<dyn Agent>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        confidence: Arc<ConfidenceTracker>,
        gate: Arc<QualityGate>,
        pr_integrator: Option<Arc<PRIntegrator>>,
        accountability: Arc<AccountabilityEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        Self {
            store,
            bus,
            queue,
            registry,
            confidence,
            gate,
            pr_integrator,
            accountability,
            config,
            report_tx,
            report_rx: Mutex::new(report_rx),
            transports: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Sender agents (or their transport wrappers) use to hand completion
    /// reports back to the scheduling loop's step 6.
    pub fn report_sender(&self) -> mpsc::UnboundedSender<AgentReport> {
        self.report_tx.clone()
    }

    pub async fn register_agent(
        &self,
        capabilities: std::collections::HashSet<String>,
        transport: Arc<dyn Agent>,
    ) -> Result<()> {
        let id = transport.id().to_string();
        self.transports.lock().await.insert(id, Arc::clone(&transport));
        self.registry.register(capabilities, transport).await
    }

    /// Runs both loops until `shutdown` fires, then drains: sleeps every
    /// active agent, flushes the event bus, and returns.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let scheduling = {
            let this = Arc::clone(&self);
            let mut shutdown_rx = shutdown.resubscribe();
            tokio::spawn(async move { this.scheduling_loop(&mut shutdown_rx).await })
        };
        let maintenance = {
            let this = Arc::clone(&self);
            let mut shutdown_rx = shutdown.resubscribe();
            tokio::spawn(async move { this.maintenance_loop(&mut shutdown_rx).await })
        };

        let _ = shutdown.recv().await;
        let _ = scheduling.await;
        let _ = maintenance.await;
        self.drain().await;
    }

    async fn scheduling_loop(&self, shutdown: &mut broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                report = async {
                    let mut rx = self.report_rx.lock().await;
                    rx.recv().await
                } => {
                    if let Some(report) = report {
                        if let Err(e) = self.handle_report(report).await {
                            error!("error handling agent report: {e}");
                        }
                    }
                }
                _ = self.dispatch_one() => {}
            }
        }
    }

    /// Steps 1-5 of the scheduling loop. Sleeps briefly and returns when
    /// there's no idle agent or no eligible task, so the `select!` above
    /// keeps servicing `agent_reports` between attempts.
    async fn dispatch_one(&self) {
        let agent = match self.registry.next_idle_agent() {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                tokio::time::sleep(IDLE_SLEEP).await;
                return;
            }
            Err(e) => {
                warn!("failed to read idle agent: {e}");
                tokio::time::sleep(IDLE_SLEEP).await;
                return;
            }
        };

        let task = match self.queue.next(&agent.capabilities, Utc::now()).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::time::sleep(IDLE_SLEEP).await;
                return;
            }
            Err(e) => {
                warn!("failed to read next task: {e}");
                tokio::time::sleep(IDLE_SLEEP).await;
                return;
            }
        };

        let context = task.decision_context();
        let agent_confidence = agent_reported_confidence(&agent);
        let external_confidence = external_confidence_of(&task);
        let decision = match self
            .confidence
            .should_involve_human(&context, agent_confidence, external_confidence)
        {
            Ok(d) => d,
            Err(e) => {
                warn!("confidence check failed for task {}: {e}", task.id);
                return;
            }
        };

        if decision.involve_human {
            if let Err(e) = self.mark_blocked(&task.id).await {
                warn!("failed to mark task {} blocked: {e}", task.id);
            }
            self.bus
                .publish(StreamEvent::new(
                    "human.requested",
                    &task.id,
                    EventPriority::High,
                    serde_json::json!({ "task_id": task.id, "fingerprint": decision.fingerprint }),
                ))
                .await;
            return;
        }

        if let Err(e) = self.queue.mark_in_progress(&task.id, &agent.id).await {
            warn!("failed to mark task {} in progress: {e}", task.id);
            return;
        }
        if let Err(e) = self.registry.mark_running(&agent.id, &task.id) {
            warn!("failed to mark agent {} running: {e}", agent.id);
        }

        let decision_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.confidence.record_outcome(
            decision_id.clone(),
            &context,
            agent_confidence,
            external_confidence,
            decision.involve_human,
            Outcome::Pending,
        ) {
            warn!("failed to record pending decision for task {}: {e}", task.id);
        }

        let transport = self.transports.lock().await.get(&agent.id).cloned();
        let Some(transport) = transport else {
            warn!("no transport registered for agent {}", agent.id);
            return;
        };

        match transport.dispatch(&task).await {
            Ok(DispatchOutcome::Accepted) => {
                info!(task_id = %task.id, agent_id = %agent.id, "dispatched task");
            }
            Ok(DispatchOutcome::Busy) => {
                let _ = self.queue.mark_failed(&task.id, true).await;
                let _ = self.registry.mark_idle(&agent.id);
            }
            Err(e) => {
                warn!("dispatch to agent {} failed: {e}", agent.id);
                let _ = self.queue.mark_failed(&task.id, true).await;
                let _ = self.registry.mark_idle(&agent.id);
            }
        }
    }

    async fn mark_blocked(&self, task_id: &str) -> Result<()> {
        let mut task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| crate::FleetError::NotFound(format!("task {task_id}")))?;
        task.status = TaskStatus::Blocked;
        self.store.put_task(&task)
    }

    /// Step 6: an agent reported completion or failure. Runs `QualityGate`
    /// on success, applies the decision, and folds the outcome back into
    /// `ConfidenceTracker`.
    async fn handle_report(&self, report: AgentReport) -> Result<()> {
        self.registry.mark_idle(&report.agent_id)?;

        match report.kind {
            AgentReportKind::Completed => {
                let artifact: Artifact = serde_json::from_value(report.payload.clone())
                    .unwrap_or_default();
                let gate_result = self.gate.evaluate(&artifact).await;

                match gate_result.decision {
                    GateDecision::Allow => {
                        self.queue.mark_completed(&report.task_id).await?;
                        if let Some(integrator) = &self.pr_integrator {
                            if let Some(pr_id) = report.payload.get("pr_id").and_then(|v| v.as_str()) {
                                if let Err(e) = integrator.integrate(pr_id).await {
                                    warn!("pr integration for task {} failed: {e}", report.task_id);
                                }
                            }
                        }
                        self.finish_decision(&report.task_id, Outcome::Success).await;
                    }
                    GateDecision::Block => {
                        self.queue.mark_failed(&report.task_id, true).await?;
                        self.finish_decision(&report.task_id, Outcome::Failure).await;
                    }
                    GateDecision::Escalate => {
                        self.mark_blocked(&report.task_id).await?;
                        self.bus
                            .publish(StreamEvent::new(
                                "human.requested",
                                &report.task_id,
                                EventPriority::High,
                                serde_json::json!({ "task_id": report.task_id, "reason": gate_result.reason }),
                            ))
                            .await;
                        self.finish_decision(&report.task_id, Outcome::Pending).await;
                    }
                }
            }
            AgentReportKind::Failed => {
                self.queue.mark_failed(&report.task_id, true).await?;
                self.finish_decision(&report.task_id, Outcome::Failure).await;
            }
            AgentReportKind::Progress | AgentReportKind::Snapshot => {}
        }
        Ok(())
    }

    async fn finish_decision(&self, task_id: &str, outcome: Outcome) {
        let Ok(Some(task)) = self.store.get_task(task_id) else {
            return;
        };
        let context = task.decision_context();
        let fingerprint = self.confidence.fingerprint(&context);
        if let Some(decision) = self.latest_pending_decision(&fingerprint) {
            if let Err(e) = self.confidence.update_outcome(&decision.id, &fingerprint, outcome) {
                warn!("failed to update decision outcome: {e}");
            }
        }
    }

    fn latest_pending_decision(&self, fingerprint: &str) -> Option<Decision> {
        self.store
            .decisions_for_fingerprint(fingerprint)
            .ok()?
            .into_iter()
            .rev()
            .find(|d| d.outcome == Outcome::Pending)
    }

    async fn maintenance_loop(&self, shutdown: &mut broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval.max(MAINTENANCE_INTERVAL));
        let mut last_cleanup = Utc::now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.registry.tick(&self.bus).await {
                        warn!("agent registry tick failed: {e}");
                    }
                    if let Err(e) = self.accountability.tick().await {
                        warn!("accountability tick failed: {e}");
                    }
                    if let Err(e) = self.reassign_timed_out_tasks().await {
                        warn!("timed-out task sweep failed: {e}");
                    }
                    if (Utc::now() - last_cleanup).num_seconds()
                        >= DECISION_CLEANUP_INTERVAL.as_secs() as i64
                    {
                        match self.confidence.cleanup_older_than(DECISION_RETENTION_DAYS) {
                            Ok(n) => info!("cleaned up {n} stale decisions"),
                            Err(e) => warn!("decision cleanup failed: {e}"),
                        }
                        last_cleanup = Utc::now();
                    }
                }
            }
        }
    }

    async fn reassign_timed_out_tasks(&self) -> Result<()> {
        for task in self.queue.timed_out(Utc::now()).await? {
            self.bus
                .publish(StreamEvent::new(
                    "task.timeout",
                    &task.id,
                    EventPriority::High,
                    serde_json::json!({ "task_id": task.id }),
                ))
                .await;
            self.queue.mark_failed(&task.id, true).await?;
            if let Some(agent_id) = &task.assigned_agent {
                let _ = self.registry.mark_idle(agent_id);
            }
        }
        Ok(())
    }

    async fn drain(&self) {
        info!("draining: sleeping active agents and flushing event bus");
        if let Ok(agents) = self.registry.list() {
            for agent in agents {
                if agent.current_task_id.is_some() {
                    let _ = self.registry.sleep(&agent.id, Vec::new()).await;
                }
            }
        }
        self.bus.flush_all_pending().await;
    }
}

/// Degrades with the agent's recent failure streak rather than a flat
/// constant, so a flaky agent's tasks actually raise `involve_human` risk.
/// Mirrors the liveness accounting the registry already keeps in
/// `consecutive_failures`; every fresh failure costs 10 points of
/// confidence down to a floor of 0.3.
fn agent_reported_confidence(agent: &AgentRecord) -> f64 {
    (1.0 - agent.consecutive_failures as f64 * 0.1).max(0.3)
}

/// Caller-supplied confidence estimate for the task, read out of `data`
/// alongside the risk flags `Task::decision_context` parses. Falls back to
/// 0.8 (the prior constant) when the caller didn't provide one.
fn external_confidence_of(task: &Task) -> f64 {
    task.data
        .get("external_confidence")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(0.8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::config::{ConfidenceConfig, EventBusConfig, QualityGateConfig};
    use crate::models::Task;
    use std::collections::HashMap;
    use std::collections::HashSet;

    fn confidence_config() -> ConfidenceConfig {
        ConfidenceConfig {
            min_samples: 5,
            high_success_threshold: 0.9,
            base_threshold: 0.1,
            high_risk_threshold: 0.2,
            risk_weights: HashMap::new(),
            fingerprint_features: vec!["task_type".to_string()],
        }
    }

    fn build() -> (Arc<Orchestrator>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let orchestrator_config = OrchestratorConfig {
            max_agents: 5,
            heartbeat_interval: Duration::from_millis(50),
            timeout_threshold: Duration::from_secs(45),
            max_consecutive_failures: 3,
            max_recovery_attempts: 3,
            task_timeout: Duration::from_secs(3600),
            queue_max_size: 100,
        };
        let bus = EventBus::new(
            "orchestrator-test",
            EventBusConfig {
                buffer_size: 64,
                flush_interval: Duration::from_millis(20),
                batch_size: 16,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
            Arc::clone(&store),
        );
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), 100));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&store), orchestrator_config.clone()));
        let confidence = Arc::new(ConfidenceTracker::new(Arc::clone(&store), confidence_config()));
        let gate = Arc::new(QualityGate::with_defaults(&QualityGateConfig {
            max_pr_size: 500,
            min_coverage: 0.5,
        }));
        let accountability = Arc::new(AccountabilityEngine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&bus),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            bus,
            queue,
            registry,
            confidence,
            gate,
            None,
            accountability,
            orchestrator_config,
        ));
        (orchestrator, store)
    }

    #[tokio::test]
    async fn dispatches_eligible_task_to_idle_agent() {
        let (orchestrator, store) = build();
        let transport = Arc::new(MockAgent::new("agent-1"));
        orchestrator
            .register_agent(HashSet::from(["code_generation".to_string()]), transport)
            .await
            .unwrap();
        orchestrator
            .queue
            .add(Task::new("t1", "code_generation", 5))
            .await
            .unwrap();

        orchestrator.dispatch_one().await;

        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn completion_report_runs_gate_and_marks_completed() {
        let (orchestrator, store) = build();
        let transport = Arc::new(MockAgent::new("agent-1"));
        orchestrator
            .register_agent(HashSet::from(["code_generation".to_string()]), transport)
            .await
            .unwrap();
        orchestrator
            .queue
            .add(Task::new("t1", "code_generation", 5))
            .await
            .unwrap();
        orchestrator.dispatch_one().await;

        orchestrator
            .handle_report(AgentReport {
                agent_id: "agent-1".to_string(),
                task_id: "t1".to_string(),
                kind: AgentReportKind::Completed,
                payload: serde_json::json!({
                    "lines_added": 10,
                    "lines_removed": 2,
                    "files_changed": ["src/a.rs"],
                    "test_files_changed": ["src/a_test.rs"],
                    "coverage_percent": 0.9
                }),
            })
            .await
            .unwrap();

        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
