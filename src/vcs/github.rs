//! `octocrab`-backed `VCSGateway`, the only concrete implementation shipped
//! (§4.7). Mirrors `dashflow-github`'s `owner`/`repo`/token construction; the
//! actual tool bodies there are usage-only, so PR/merge/branch calls go
//! straight against `octocrab`'s own pulls/repos endpoints.

use super::{DiffStats, MergeOutcome, PrFilter, PullRequest, VCSGateway};
use crate::{FleetError, Result};
use async_trait::async_trait;
use octocrab::params::pulls::MergeMethod;
use octocrab::params::State as PrState;
use octocrab::Octocrab;

pub struct GitHubGateway {
    client: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubGateway {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: &str) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .map_err(|e| FleetError::Vcs(e.to_string()))?;
        Ok(Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    fn pr_number(id: &str) -> Result<u64> {
        id.parse()
            .map_err(|_| FleetError::Vcs(format!("invalid pull request id: {id}")))
    }
}

#[async_trait]
impl VCSGateway for GitHubGateway {
    async fn get_pr(&self, id: &str) -> Result<PullRequest> {
        let number = Self::pr_number(id)?;
        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .get(number)
            .await
            .map_err(|e| FleetError::Vcs(e.to_string()))?;
        Ok(to_pull_request(pr))
    }

    async fn list_open_prs(&self, filter: &PrFilter) -> Result<Vec<PullRequest>> {
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list()
            .state(PrState::Open)
            .send()
            .await
            .map_err(|e| FleetError::Vcs(e.to_string()))?;

        Ok(page
            .items
            .into_iter()
            .map(to_pull_request)
            .filter(|pr| {
                filter
                    .branch_prefix
                    .as_ref()
                    .map(|p| pr.head_ref.starts_with(p.as_str()))
                    .unwrap_or(true)
            })
            .collect())
    }

    async fn merge(&self, id: &str, title: &str, message: &str) -> Result<MergeOutcome> {
        let number = Self::pr_number(id)?;
        let result = self
            .client
            .pulls(&self.owner, &self.repo)
            .merge(number)
            .method(MergeMethod::Squash)
            .title(title.to_string())
            .message(message.to_string())
            .send()
            .await
            .map_err(|e| FleetError::Vcs(e.to_string()))?;

        if result.merged {
            Ok(MergeOutcome::Ok)
        } else {
            Ok(MergeOutcome::Conflict)
        }
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let reference = octocrab::params::repos::Reference::Branch(name.to_string());
        self.client
            .repos(&self.owner, &self.repo)
            .delete_ref(&reference)
            .await
            .map_err(|e| FleetError::Vcs(e.to_string()))?;
        Ok(())
    }

    async fn get_diff_stats(&self, id: &str) -> Result<DiffStats> {
        let number = Self::pr_number(id)?;
        let files = self
            .client
            .pulls(&self.owner, &self.repo)
            .list_files(number)
            .await
            .map_err(|e| FleetError::Vcs(e.to_string()))?;

        let mut lines_added = 0u64;
        let mut lines_removed = 0u64;
        let mut files_changed = Vec::new();
        for file in files.items {
            lines_added += file.additions;
            lines_removed += file.deletions;
            files_changed.push(file.filename);
        }

        Ok(DiffStats {
            lines_added,
            lines_removed,
            files_changed,
        })
    }
}

fn to_pull_request(pr: octocrab::models::pulls::PullRequest) -> PullRequest {
    let state = pr
        .state
        .map(|s| format!("{s:?}").to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    let checks_state = pr
        .mergeable_state
        .map(|s| format!("{s:?}").to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    PullRequest {
        id: pr.number.to_string(),
        title: pr.title.unwrap_or_default(),
        state,
        head_ref: pr.head.ref_field,
        base_ref: pr.base.ref_field,
        mergeable: pr.mergeable.unwrap_or(false),
        checks_state,
    }
}
