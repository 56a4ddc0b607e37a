//! The `Agent` interface the core dispatches work through (§6, §9). Agents
//! are opaque LLM-driven workers; the core only needs `Dispatch`/`Probe`/
//! `Shutdown` plus an async report channel. Three concrete transports are
//! provided, mirroring the teacher's `ClaudeCodeCliClient` (subprocess) and
//! `reqwest`-based API calls, plus an in-memory variant for tests.

use crate::models::Task;
use crate::{FleetError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    Unresponsive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentReportKind {
    Progress,
    Completed,
    Failed,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub task_id: String,
    pub kind: AgentReportKind,
    pub payload: serde_json::Value,
}

/// Pluggable transport to a worker process. Implementations never panic;
/// transport failures surface as `Result::Err` or `ProbeOutcome::Unresponsive`.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome>;
    async fn probe(&self) -> ProbeOutcome;
    async fn shutdown(&self) -> Result<()>;

    /// Brings the agent back from a heartbeat timeout after `shutdown` has
    /// torn it down. Called by the registry's recovery ladder once a probe
    /// succeeds again; implementations reset whatever local state a stale
    /// session could have left behind rather than trusting the bare probe.
    async fn restart(&self) -> Result<()>;
}

/// Spawns and health-checks a worker CLI subprocess. Mirrors the teacher's
/// `ClaudeCodeCliClient` shelling out to the `claude` binary: a configured
/// executable path, JSON over stdout, and a liveness probe that runs the
/// binary with a cheap flag rather than keeping a persistent handle open.
pub struct ProcessAgent {
    id: String,
    binary: String,
    busy: Arc<Mutex<bool>>,
}

impl ProcessAgent {
    pub fn new(id: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            binary: binary.into(),
            busy: Arc::new(Mutex::new(false)),
        }
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome> {
        let mut busy = self.busy.lock().await;
        if *busy {
            return Ok(DispatchOutcome::Busy);
        }
        *busy = true;
        drop(busy);

        let payload = serde_json::to_string(task)?;
        let busy = Arc::clone(&self.busy);
        let binary = self.binary.clone();
        let agent_id = self.id.clone();
        tokio::spawn(async move {
            let result = Command::new(&binary)
                .arg("--task")
                .arg(&payload)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await;
            if let Err(e) = result {
                warn!(agent_id = %agent_id, "process agent dispatch failed: {}", e);
            }
            *busy.lock().await = false;
        });

        Ok(DispatchOutcome::Accepted)
    }

    async fn probe(&self) -> ProbeOutcome {
        match Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => ProbeOutcome::Alive,
            _ => ProbeOutcome::Unresponsive,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        debug!(agent_id = %self.id, "process agent shutdown requested");
        Ok(())
    }

    /// Each dispatch spawns its own subprocess, so there is no persistent
    /// process to relaunch; what can go stale is the `busy` flag if a prior
    /// subprocess was killed out from under us. Clearing it is the whole
    /// restart.
    async fn restart(&self) -> Result<()> {
        *self.busy.lock().await = false;
        Ok(())
    }
}

/// HTTP-addressed worker, for agents running as a network-reachable service.
pub struct RemoteAgent {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteAgent {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome> {
        let response = self
            .client
            .post(format!("{}/dispatch", self.base_url))
            .json(task)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(DispatchOutcome::Busy);
        }
        if !response.status().is_success() {
            return Err(FleetError::Agent(format!(
                "remote agent {} rejected dispatch: {}",
                self.id,
                response.status()
            )));
        }
        Ok(DispatchOutcome::Accepted)
    }

    async fn probe(&self) -> ProbeOutcome {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => ProbeOutcome::Alive,
            _ => ProbeOutcome::Unresponsive,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self
            .client
            .post(format!("{}/shutdown", self.base_url))
            .send()
            .await;
        Ok(())
    }

    /// Asks the remote host to relaunch its worker process. A non-success
    /// response means the host is still down; the registry keeps the agent
    /// in `Recovering` rather than trusting the earlier bare probe.
    async fn restart(&self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/restart", self.base_url))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FleetError::Agent(format!(
                "remote agent {} refused restart: {}",
                self.id,
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory agent for tests and local development; never talks to a real
/// process. Mirrors the teacher's `tests/mock.rs` mock client pattern.
pub struct MockAgent {
    id: String,
    pub fail_probe: Arc<Mutex<bool>>,
    pub busy: Arc<Mutex<bool>>,
}

impl MockAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fail_probe: Arc::new(Mutex::new(false)),
            busy: Arc::new(Mutex::new(false)),
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn dispatch(&self, _task: &Task) -> Result<DispatchOutcome> {
        if *self.busy.lock().await {
            return Ok(DispatchOutcome::Busy);
        }
        Ok(DispatchOutcome::Accepted)
    }

    async fn probe(&self) -> ProbeOutcome {
        if *self.fail_probe.lock().await {
            ProbeOutcome::Unresponsive
        } else {
            ProbeOutcome::Alive
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        *self.busy.lock().await = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_agent_reports_unresponsive_when_flagged() {
        let agent = MockAgent::new("m1");
        assert_eq!(agent.probe().await, ProbeOutcome::Alive);
        *agent.fail_probe.lock().await = true;
        assert_eq!(agent.probe().await, ProbeOutcome::Unresponsive);
    }

    #[tokio::test]
    async fn mock_agent_reports_busy() {
        let agent = MockAgent::new("m1");
        *agent.busy.lock().await = true;
        let task = Task::new("t1", "code_generation", 1);
        assert_eq!(agent.dispatch(&task).await.unwrap(), DispatchOutcome::Busy);
    }
}
