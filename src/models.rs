//! Core data model: tasks, agents, memory snapshots, confidence decisions,
//! escalations and the events that flow across the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// (a)-(d) in the task invariants: `InProgress` implies an assigned agent,
/// attempts never exceed `max_attempts`, dependency gating keeps a task out
/// of `Assigned` until its parents complete, and transitions follow the
/// state machine in the queue module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
    WaitingDependency,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::WaitingDependency => "waiting_dependency",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => TaskStatus::Pending,
            "assigned" => TaskStatus::Assigned,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "blocked" => TaskStatus::Blocked,
            "waiting_dependency" => TaskStatus::WaitingDependency,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub priority: i64,
    pub data: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: HashSet<String>,
    pub timeout_seconds: Option<i64>,
    pub max_attempts: u32,
    pub attempts: u32,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: String::new(),
            priority,
            data: HashMap::new(),
            created_at: Utc::now(),
            deadline: None,
            dependencies: HashSet::new(),
            timeout_seconds: None,
            max_attempts: 3,
            attempts: 0,
            status: TaskStatus::Pending,
            assigned_agent: None,
            started_at: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: HashSet<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Reads the risk-relevant flags a caller stashed in `data` (§3's opaque
    /// map) into the canonical `DecisionContext` the confidence tracker
    /// scores against. Unrecognized keys pass through in `extra`; missing or
    /// unparseable flags default to `false`/empty, matching `DecisionContext`'s
    /// own `Default`.
    pub fn decision_context(&self) -> DecisionContext {
        let flag = |key: &str| self.data.get(key).map(|v| v == "true").unwrap_or(false);
        let known: HashSet<&str> = [
            "complexity",
            "has_security_implications",
            "has_architecture_changes",
            "affects_performance",
            "is_customer_facing",
            "modifies_critical_path",
        ]
        .into_iter()
        .collect();

        DecisionContext {
            task_type: self.task_type.clone(),
            complexity: self.data.get("complexity").cloned().unwrap_or_default(),
            has_security_implications: flag("has_security_implications"),
            has_architecture_changes: flag("has_architecture_changes"),
            affects_performance: flag("affects_performance"),
            is_customer_facing: flag("is_customer_facing"),
            modifies_critical_path: flag("modifies_critical_path"),
            extra: self
                .data
                .iter()
                .filter(|(k, _)| !known.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// (e)-(g): `current_task_id` is set iff `Running`, too many consecutive
/// failures forces `Crashed`, and recovery attempts are bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Starting,
    Running,
    Idle,
    Sleeping,
    Recovering,
    Timeout,
    Crashed,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Recovering => "recovering",
            AgentStatus::Timeout => "timeout",
            AgentStatus::Crashed => "crashed",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "starting" => AgentStatus::Starting,
            "running" => AgentStatus::Running,
            "idle" => AgentStatus::Idle,
            "sleeping" => AgentStatus::Sleeping,
            "recovering" => AgentStatus::Recovering,
            "timeout" => AgentStatus::Timeout,
            "crashed" => AgentStatus::Crashed,
            "terminated" => AgentStatus::Terminated,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: HashSet<String>,
    pub resource_requirements: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub process_id: Option<u32>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub current_task_id: Option<String>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            resource_requirements: HashMap::new(),
            metadata: HashMap::new(),
            process_id: None,
            status: AgentStatus::Starting,
            last_heartbeat: Utc::now(),
            consecutive_failures: 0,
            recovery_attempts: 0,
            current_task_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Sleep,
    Checkpoint,
    Crash,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Sleep => "sleep",
            SnapshotKind::Checkpoint => "checkpoint",
            SnapshotKind::Crash => "crash",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "sleep" => SnapshotKind::Sleep,
            "checkpoint" => SnapshotKind::Checkpoint,
            "crash" => SnapshotKind::Crash,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub snapshot_id: String,
    pub agent_id: String,
    pub kind: SnapshotKind,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Pending,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Pending => "pending",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            "pending" => Outcome::Pending,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub context_fingerprint: String,
    pub agent_confidence: f64,
    pub external_confidence: f64,
    pub human_involved: bool,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub fingerprint: String,
    pub success_rate: f64,
    pub sample_count: u32,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscalationLevel {
    Low,
    Medium,
    High,
    Critical,
    SystemFailure,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Low => "low",
            EscalationLevel::Medium => "medium",
            EscalationLevel::High => "high",
            EscalationLevel::Critical => "critical",
            EscalationLevel::SystemFailure => "system_failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub agent_id: Option<String>,
    pub task_id: String,
    pub level: EscalationLevel,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub partition_key: String,
    pub priority: EventPriority,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
}

impl StreamEvent {
    pub fn new(
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        priority: EventPriority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            partition_key: partition_key.into(),
            priority,
            payload,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// The risk-relevant decision context passed to `ConfidenceTracker`. Callers
/// supply an opaque string map at the API boundary (§9 design note); this is
/// the canonicalized form used internally for fingerprinting and scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionContext {
    pub task_type: String,
    pub complexity: String,
    pub has_security_implications: bool,
    pub has_architecture_changes: bool,
    pub affects_performance: bool,
    pub is_customer_facing: bool,
    pub modifies_critical_path: bool,
    pub extra: HashMap<String, String>,
}

/// Artifact produced by an agent, evaluated by `QualityGate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_changed: Vec<String>,
    pub test_files_changed: Vec<String>,
    pub coverage_percent: Option<f64>,
    pub lint_errors: u32,
    pub lint_warnings: u32,
    pub security_findings: u32,
    pub max_cyclomatic_complexity: u32,
}

impl Artifact {
    pub fn lines_changed(&self) -> u64 {
        self.lines_added + self.lines_removed
    }
}
