//! `VCSGateway` abstraction consumed by `PRIntegrator` and `QualityGate`
//! (§6). Git mechanics and code-host API clients are explicitly out of
//! scope for the core; this is the seam. The production implementation is
//! grounded in `dashflow-github`, the pack's own GitHub-integration crate,
//! which wraps `octocrab` for exactly this surface (issues, PRs, merges).

pub mod github;
pub mod pr_integrator;

use crate::models::Artifact;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub title: String,
    pub state: String,
    pub head_ref: String,
    pub base_ref: String,
    pub mergeable: bool,
    pub checks_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffStats {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_changed: Vec<String>,
}

impl DiffStats {
    pub fn into_artifact(self) -> Artifact {
        Artifact {
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            files_changed: self.files_changed,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Ok,
    Conflict,
}

#[derive(Debug, Clone, Default)]
pub struct PrFilter {
    pub branch_prefix: Option<String>,
}

#[async_trait]
pub trait VCSGateway: Send + Sync {
    async fn get_pr(&self, id: &str) -> Result<PullRequest>;
    async fn list_open_prs(&self, filter: &PrFilter) -> Result<Vec<PullRequest>>;
    async fn merge(&self, id: &str, title: &str, message: &str) -> Result<MergeOutcome>;
    async fn delete_branch(&self, name: &str) -> Result<()>;
    async fn get_diff_stats(&self, id: &str) -> Result<DiffStats>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    pub struct MockVCSGateway {
        pub prs: Mutex<HashMap<String, PullRequest>>,
        pub diffs: Mutex<HashMap<String, DiffStats>>,
        pub merged: Mutex<Vec<String>>,
        pub deleted_branches: Mutex<Vec<String>>,
    }

    impl MockVCSGateway {
        pub fn new() -> Self {
            Self {
                prs: Mutex::new(HashMap::new()),
                diffs: Mutex::new(HashMap::new()),
                merged: Mutex::new(Vec::new()),
                deleted_branches: Mutex::new(Vec::new()),
            }
        }

        pub async fn seed(&self, pr: PullRequest, diff: DiffStats) {
            self.diffs.lock().await.insert(pr.id.clone(), diff);
            self.prs.lock().await.insert(pr.id.clone(), pr);
        }
    }

    impl Default for MockVCSGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl VCSGateway for MockVCSGateway {
        async fn get_pr(&self, id: &str) -> Result<PullRequest> {
            self.prs
                .lock()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| crate::FleetError::NotFound(format!("pr {id}")))
        }

        async fn list_open_prs(&self, filter: &PrFilter) -> Result<Vec<PullRequest>> {
            let prs = self.prs.lock().await;
            Ok(prs
                .values()
                .filter(|pr| pr.state == "open")
                .filter(|pr| {
                    filter
                        .branch_prefix
                        .as_ref()
                        .map(|p| pr.head_ref.starts_with(p.as_str()))
                        .unwrap_or(true)
                })
                .cloned()
                .collect())
        }

        async fn merge(&self, id: &str, _title: &str, _message: &str) -> Result<MergeOutcome> {
            let mut prs = self.prs.lock().await;
            let pr = prs
                .get_mut(id)
                .ok_or_else(|| crate::FleetError::NotFound(format!("pr {id}")))?;
            if !pr.mergeable {
                return Ok(MergeOutcome::Conflict);
            }
            pr.state = "merged".to_string();
            self.merged.lock().await.push(id.to_string());
            Ok(MergeOutcome::Ok)
        }

        async fn delete_branch(&self, name: &str) -> Result<()> {
            self.deleted_branches.lock().await.push(name.to_string());
            Ok(())
        }

        async fn get_diff_stats(&self, id: &str) -> Result<DiffStats> {
            self.diffs
                .lock()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| crate::FleetError::NotFound(format!("diff stats for pr {id}")))
        }
    }
}
