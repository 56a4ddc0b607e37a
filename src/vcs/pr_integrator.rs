//! Fetch → verify → gate → merge → cleanup pipeline for one pull request,
//! plus batch integration over all open PRs matching a branch prefix
//! (§4.7). Each step is independently idempotent: re-running after a
//! partial failure (say, a merge that succeeded but whose branch delete
//! failed) re-fetches current state rather than assuming prior progress.

use crate::event_bus::EventBus;
use crate::models::{EventPriority, StreamEvent};
use crate::quality::{GateDecision, QualityGate};
use crate::vcs::{MergeOutcome, PrFilter, VCSGateway};
use crate::{FleetError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub enum IntegrationOutcome {
    Merged,
    Blocked { reason: String },
    Escalated { reason: String },
    Conflict,
}

pub struct PRIntegrator {
    vcs: Arc<dyn VCSGateway>,
    gate: Arc<QualityGate>,
    bus: Arc<EventBus>,
}

impl PRIntegrator {
    pub fn new(vcs: Arc<dyn VCSGateway>, gate: Arc<QualityGate>, bus: Arc<EventBus>) -> Self {
        Self { vcs, gate, bus }
    }

    pub async fn integrate(&self, pr_id: &str) -> Result<IntegrationOutcome> {
        let pr = self.vcs.get_pr(pr_id).await?;

        if pr.state != "open" {
            return Err(FleetError::Vcs(format!(
                "pull request {pr_id} is not open (state: {})",
                pr.state
            )));
        }
        if !pr.mergeable {
            self.publish("pr.integration.conflict", pr_id, serde_json::json!({}))
                .await;
            return Ok(IntegrationOutcome::Conflict);
        }

        let diff = self.vcs.get_diff_stats(pr_id).await?;
        let artifact = diff.into_artifact();
        let gate_result = self.gate.evaluate(&artifact).await;

        self.publish(
            "pr.gate.evaluated",
            pr_id,
            serde_json::json!({ "decision": format!("{:?}", gate_result.decision), "score": gate_result.confidence }),
        )
        .await;

        match gate_result.decision {
            GateDecision::Block => {
                self.publish(
                    "pr.integration.blocked",
                    pr_id,
                    serde_json::json!({ "reason": gate_result.reason }),
                )
                .await;
                Ok(IntegrationOutcome::Blocked {
                    reason: gate_result.reason,
                })
            }
            GateDecision::Escalate => {
                self.publish(
                    "pr.integration.escalated",
                    pr_id,
                    serde_json::json!({ "reason": gate_result.reason }),
                )
                .await;
                Ok(IntegrationOutcome::Escalated {
                    reason: gate_result.reason,
                })
            }
            GateDecision::Allow => {
                let title = format!("{} (#{})", pr.title, pr_id);
                let message = "merged automatically after passing quality gate".to_string();
                match self.vcs.merge(pr_id, &title, &message).await? {
                    MergeOutcome::Conflict => {
                        self.publish("pr.integration.conflict", pr_id, serde_json::json!({}))
                            .await;
                        Ok(IntegrationOutcome::Conflict)
                    }
                    MergeOutcome::Ok => {
                        if let Err(e) = self.vcs.delete_branch(&pr.head_ref).await {
                            tracing::warn!(
                                "merged pr {pr_id} but failed to delete branch {}: {e}",
                                pr.head_ref
                            );
                        }
                        self.publish(
                            "pr.integration.merged",
                            pr_id,
                            serde_json::json!({ "branch": pr.head_ref }),
                        )
                        .await;
                        Ok(IntegrationOutcome::Merged)
                    }
                }
            }
        }
    }

    /// Enumerates every open PR matching the configured branch prefix and
    /// integrates each in turn. A single failure does not stop the batch.
    pub async fn integrate_ready(&self, filter: &PrFilter) -> Result<Vec<(String, IntegrationOutcome)>> {
        let prs = self.vcs.list_open_prs(filter).await?;
        let mut outcomes = Vec::with_capacity(prs.len());
        for pr in prs {
            match self.integrate(&pr.id).await {
                Ok(outcome) => outcomes.push((pr.id, outcome)),
                Err(e) => {
                    tracing::warn!("failed to integrate pr {}: {e}", pr.id);
                    outcomes.push((
                        pr.id,
                        IntegrationOutcome::Blocked {
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }
        Ok(outcomes)
    }

    async fn publish(&self, event_type: &str, pr_id: &str, payload: serde_json::Value) {
        self.bus
            .publish(StreamEvent::new(
                event_type,
                format!("pr:{pr_id}"),
                EventPriority::Medium,
                payload,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityGateConfig;
    use crate::event_bus::EventBus as Bus;
    use crate::store::Store;
    use crate::vcs::mock::MockVCSGateway;
    use crate::vcs::{DiffStats, PullRequest};
    use std::time::Duration;

    fn gate() -> Arc<QualityGate> {
        Arc::new(QualityGate::with_defaults(&QualityGateConfig {
            max_pr_size: 500,
            min_coverage: 0.8,
        }))
    }

    fn bus() -> Arc<Bus> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        Bus::new(
            "pr-integrator-test",
            crate::config::EventBusConfig {
                buffer_size: 64,
                flush_interval: Duration::from_millis(10),
                batch_size: 16,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
            store,
        )
    }

    #[tokio::test]
    async fn clean_pr_merges_and_deletes_branch() {
        let vcs = Arc::new(MockVCSGateway::new());
        vcs.seed(
            PullRequest {
                id: "1".to_string(),
                title: "add feature".to_string(),
                state: "open".to_string(),
                head_ref: "feature/x".to_string(),
                base_ref: "main".to_string(),
                mergeable: true,
                checks_state: "success".to_string(),
            },
            DiffStats {
                lines_added: 40,
                lines_removed: 10,
                files_changed: vec!["src/a.rs".to_string()],
            },
        )
        .await;

        let integrator = PRIntegrator::new(vcs.clone(), gate(), bus());
        let outcome = integrator.integrate("1").await.unwrap();
        assert!(matches!(outcome, IntegrationOutcome::Merged));
        assert_eq!(vcs.deleted_branches.lock().await.as_slice(), ["feature/x"]);
    }

    #[tokio::test]
    async fn unmergeable_pr_reports_conflict() {
        let vcs = Arc::new(MockVCSGateway::new());
        vcs.seed(
            PullRequest {
                id: "2".to_string(),
                title: "conflicting".to_string(),
                state: "open".to_string(),
                head_ref: "feature/y".to_string(),
                base_ref: "main".to_string(),
                mergeable: false,
                checks_state: "success".to_string(),
            },
            DiffStats {
                lines_added: 5,
                lines_removed: 0,
                files_changed: vec![],
            },
        )
        .await;

        let integrator = PRIntegrator::new(vcs, gate(), bus());
        let outcome = integrator.integrate("2").await.unwrap();
        assert!(matches!(outcome, IntegrationOutcome::Conflict));
    }

    #[tokio::test]
    async fn oversize_pr_is_blocked_not_merged() {
        let vcs = Arc::new(MockVCSGateway::new());
        vcs.seed(
            PullRequest {
                id: "3".to_string(),
                title: "huge refactor".to_string(),
                state: "open".to_string(),
                head_ref: "feature/huge".to_string(),
                base_ref: "main".to_string(),
                mergeable: true,
                checks_state: "success".to_string(),
            },
            DiffStats {
                lines_added: 900,
                lines_removed: 100,
                files_changed: vec!["src/a.rs".to_string()],
            },
        )
        .await;

        let integrator = PRIntegrator::new(vcs.clone(), gate(), bus());
        let outcome = integrator.integrate("3").await.unwrap();
        assert!(matches!(outcome, IntegrationOutcome::Blocked { .. }));
        assert!(vcs.merged.lock().await.is_empty());
    }
}
