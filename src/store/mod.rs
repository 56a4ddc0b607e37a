//! Durable state: tasks, agents, memory snapshots, decisions, patterns,
//! escalations and events, over an embedded relational engine.
//!
//! A single writer serializes mutations through a mutex-guarded connection;
//! `rusqlite`'s WAL mode lets readers proceed without blocking on it. Schema
//! migrations are forward-only and gated on `PRAGMA user_version`.

use crate::models::*;
use crate::{FleetError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE tasks (
        id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        description TEXT NOT NULL,
        priority INTEGER NOT NULL,
        data_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        deadline TEXT,
        dependencies_json TEXT NOT NULL,
        timeout_seconds INTEGER,
        max_attempts INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        status TEXT NOT NULL,
        assigned_agent TEXT,
        started_at TEXT
    );
    CREATE INDEX idx_tasks_status_priority ON tasks(status, priority DESC, created_at ASC);

    CREATE TABLE agents (
        id TEXT PRIMARY KEY,
        capabilities_json TEXT NOT NULL,
        resource_requirements_json TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        process_id INTEGER,
        status TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL,
        consecutive_failures INTEGER NOT NULL,
        recovery_attempts INTEGER NOT NULL,
        current_task_id TEXT
    );

    CREATE TABLE memory_snapshots (
        snapshot_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload BLOB NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_snapshots_agent ON memory_snapshots(agent_id, created_at DESC);

    CREATE TABLE decisions (
        id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        agent_confidence REAL NOT NULL,
        external_confidence REAL NOT NULL,
        human_involved INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );
    CREATE INDEX idx_decisions_fingerprint ON decisions(fingerprint, recorded_at);

    CREATE TABLE patterns (
        fingerprint TEXT PRIMARY KEY,
        success_rate REAL NOT NULL,
        sample_count INTEGER NOT NULL,
        last_updated TEXT NOT NULL
    );

    CREATE TABLE escalations (
        id TEXT PRIMARY KEY,
        agent_id TEXT,
        task_id TEXT NOT NULL,
        level TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at TEXT NOT NULL,
        resolved_at TEXT
    );

    CREATE TABLE events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        priority TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        tags_json TEXT NOT NULL
    );
    CREATE INDEX idx_events_timestamp ON events(timestamp);
    "#,
];

pub struct Store {
    conn: Mutex<Connection>,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let current_version: i64 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        let current_version = current_version as usize;

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            if i < current_version {
                continue;
            }
            conn.execute_batch(migration).map_err(|e| {
                FleetError::StoreMessage(format!("migration {} failed: {}", i, e))
            })?;
            conn.pragma_update(None, "user_version", (i + 1) as i64)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FleetError::StoreMessage("store mutex poisoned".to_string()))
    }

    // ---- tasks ----

    pub fn put_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, task_type, description, priority, data_json, created_at,
                deadline, dependencies_json, timeout_seconds, max_attempts, attempts, status,
                assigned_agent, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                task_type=excluded.task_type, description=excluded.description,
                priority=excluded.priority, data_json=excluded.data_json,
                deadline=excluded.deadline, dependencies_json=excluded.dependencies_json,
                timeout_seconds=excluded.timeout_seconds, max_attempts=excluded.max_attempts,
                attempts=excluded.attempts, status=excluded.status,
                assigned_agent=excluded.assigned_agent, started_at=excluded.started_at",
            params![
                task.id,
                task.task_type,
                task.description,
                task.priority,
                serde_json::to_string(&task.data)?,
                task.created_at.to_rfc3339(),
                task.deadline.map(|d| d.to_rfc3339()),
                serde_json::to_string(&task.dependencies)?,
                task.timeout_seconds,
                task.max_attempts,
                task.attempts,
                task.status.as_str(),
                task.assigned_agent,
                task.started_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], |row| {
            Self::row_to_task(row)
        })
        .optional()
        .map_err(FleetError::from)
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE status = ?1 ORDER BY priority DESC, created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![status.as_str()], |row| Self::row_to_task(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_all_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], |row| Self::row_to_task(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let data_json: String = row.get("data_json")?;
        let deps_json: String = row.get("dependencies_json")?;
        let status: String = row.get("status")?;
        let deadline: Option<String> = row.get("deadline")?;
        let started_at: Option<String> = row.get("started_at")?;
        Ok(Task {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            description: row.get("description")?,
            priority: row.get("priority")?,
            data: serde_json::from_str::<HashMap<String, String>>(&data_json)
                .unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>("created_at")?),
            deadline: deadline.map(|d| parse_dt(&d)),
            dependencies: serde_json::from_str::<HashSet<String>>(&deps_json)
                .unwrap_or_default(),
            timeout_seconds: row.get("timeout_seconds")?,
            max_attempts: row.get("max_attempts")?,
            attempts: row.get("attempts")?,
            status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
            assigned_agent: row.get("assigned_agent")?,
            started_at: started_at.map(|d| parse_dt(&d)),
        })
    }

    // ---- agents ----

    pub fn put_agent(&self, agent: &AgentRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agents (id, capabilities_json, resource_requirements_json,
                metadata_json, process_id, status, last_heartbeat, consecutive_failures,
                recovery_attempts, current_task_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                capabilities_json=excluded.capabilities_json,
                resource_requirements_json=excluded.resource_requirements_json,
                metadata_json=excluded.metadata_json, process_id=excluded.process_id,
                status=excluded.status, last_heartbeat=excluded.last_heartbeat,
                consecutive_failures=excluded.consecutive_failures,
                recovery_attempts=excluded.recovery_attempts,
                current_task_id=excluded.current_task_id",
            params![
                agent.id,
                serde_json::to_string(&agent.capabilities)?,
                serde_json::to_string(&agent.resource_requirements)?,
                serde_json::to_string(&agent.metadata)?,
                agent.process_id,
                agent.status.as_str(),
                agent.last_heartbeat.to_rfc3339(),
                agent.consecutive_failures,
                agent.recovery_attempts,
                agent.current_task_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let conn = self.lock()?;
        conn.query_row("SELECT * FROM agents WHERE id = ?1", params![id], |row| {
            Self::row_to_agent(row)
        })
        .optional()
        .map_err(FleetError::from)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM agents ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| Self::row_to_agent(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentRecord> {
        let caps_json: String = row.get("capabilities_json")?;
        let reqs_json: String = row.get("resource_requirements_json")?;
        let meta_json: String = row.get("metadata_json")?;
        let status: String = row.get("status")?;
        Ok(AgentRecord {
            id: row.get("id")?,
            capabilities: serde_json::from_str::<HashSet<String>>(&caps_json)
                .unwrap_or_default(),
            resource_requirements: serde_json::from_str::<HashMap<String, String>>(&reqs_json)
                .unwrap_or_default(),
            metadata: serde_json::from_str::<HashMap<String, String>>(&meta_json)
                .unwrap_or_default(),
            process_id: row.get("process_id")?,
            status: AgentStatus::from_str(&status).unwrap_or(AgentStatus::Starting),
            last_heartbeat: parse_dt(&row.get::<_, String>("last_heartbeat")?),
            consecutive_failures: row.get("consecutive_failures")?,
            recovery_attempts: row.get("recovery_attempts")?,
            current_task_id: row.get("current_task_id")?,
        })
    }

    // ---- memory snapshots ----

    pub fn put_snapshot(&self, snapshot: &MemorySnapshot) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO memory_snapshots (snapshot_id, agent_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.snapshot_id,
                snapshot.agent_id,
                snapshot.kind.as_str(),
                snapshot.payload,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self, agent_id: &str) -> Result<Option<MemorySnapshot>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM memory_snapshots WHERE agent_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            params![agent_id],
            |row| {
                let kind: String = row.get("kind")?;
                Ok(MemorySnapshot {
                    snapshot_id: row.get("snapshot_id")?,
                    agent_id: row.get("agent_id")?,
                    kind: SnapshotKind::from_str(&kind).unwrap_or(SnapshotKind::Sleep),
                    payload: row.get("payload")?,
                    created_at: parse_dt(&row.get::<_, String>("created_at")?),
                })
            },
        )
        .optional()
        .map_err(FleetError::from)
    }

    // ---- decisions & patterns ----

    pub fn insert_decision(&self, decision: &Decision) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO decisions (id, fingerprint, agent_confidence, external_confidence,
                human_involved, outcome, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision.id,
                decision.context_fingerprint,
                decision.agent_confidence,
                decision.external_confidence,
                decision.human_involved,
                decision.outcome.as_str(),
                decision.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_decision_outcome(&self, id: &str, outcome: Outcome) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE decisions SET outcome = ?1 WHERE id = ?2",
            params![outcome.as_str(), id],
        )?;
        if updated == 0 {
            return Err(FleetError::NotFound(format!("decision {id}")));
        }
        Ok(())
    }

    pub fn decisions_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<Decision>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM decisions WHERE fingerprint = ?1 ORDER BY recorded_at ASC",
        )?;
        let rows = stmt
            .query_map(params![fingerprint], |row| {
                let outcome: String = row.get("outcome")?;
                Ok(Decision {
                    id: row.get("id")?,
                    context_fingerprint: row.get("fingerprint")?,
                    agent_confidence: row.get("agent_confidence")?,
                    external_confidence: row.get("external_confidence")?,
                    human_involved: row.get("human_involved")?,
                    outcome: Outcome::from_str(&outcome).unwrap_or(Outcome::Pending),
                    recorded_at: parse_dt(&row.get::<_, String>("recorded_at")?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_pattern(&self, fingerprint: &str) -> Result<Option<Pattern>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM patterns WHERE fingerprint = ?1",
            params![fingerprint],
            |row| {
                Ok(Pattern {
                    fingerprint: row.get("fingerprint")?,
                    success_rate: row.get("success_rate")?,
                    sample_count: row.get("sample_count")?,
                    last_updated: parse_dt(&row.get::<_, String>("last_updated")?),
                })
            },
        )
        .optional()
        .map_err(FleetError::from)
    }

    pub fn upsert_pattern(&self, pattern: &Pattern) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO patterns (fingerprint, success_rate, sample_count, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(fingerprint) DO UPDATE SET
                success_rate=excluded.success_rate, sample_count=excluded.sample_count,
                last_updated=excluded.last_updated",
            params![
                pattern.fingerprint,
                pattern.success_rate,
                pattern.sample_count,
                pattern.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn cleanup_decisions_older_than(&self, days: i64) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let deleted = conn.execute(
            "DELETE FROM decisions WHERE recorded_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // ---- escalations ----

    pub fn insert_escalation(&self, escalation: &Escalation) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO escalations (id, agent_id, task_id, level, reason, created_at,
                resolved_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                escalation.id,
                escalation.agent_id,
                escalation.task_id,
                escalation.level.as_str(),
                escalation.reason,
                escalation.created_at.to_rfc3339(),
                escalation.resolved_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    // ---- events (durable append-only log backing the EventBus) ----

    pub fn append_event(&self, event: &StreamEvent) -> Result<()> {
        let conn = self.lock()?;
        let priority = match event.priority {
            EventPriority::Low => "low",
            EventPriority::Medium => "medium",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        };
        conn.execute(
            "INSERT INTO events (event_id, event_type, timestamp, priority, partition_key,
                payload_json, tags_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.event_type,
                event.timestamp.to_rfc3339(),
                priority,
                event.partition_key,
                serde_json::to_string(&event.payload)?,
                serde_json::to_string(&event.tags)?,
            ],
        )?;
        Ok(())
    }

    pub fn tail_events(&self, limit: usize) -> Result<Vec<StreamEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit as i64], |row| {
                let priority: String = row.get("priority")?;
                let payload_json: String = row.get("payload_json")?;
                let tags_json: String = row.get("tags_json")?;
                Ok(StreamEvent {
                    event_id: row.get("event_id")?,
                    event_type: row.get("event_type")?,
                    timestamp: parse_dt(&row.get::<_, String>("timestamp")?),
                    partition_key: row.get("partition_key")?,
                    priority: match priority.as_str() {
                        "low" => EventPriority::Low,
                        "high" => EventPriority::High,
                        "critical" => EventPriority::Critical,
                        _ => EventPriority::Medium,
                    },
                    payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
                    tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_task() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new("t1", "code_generation", 5);
        store.put_task(&task).unwrap();
        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.id, "t1");
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn upsert_overwrites_existing_task() {
        let store = Store::open_in_memory().unwrap();
        let mut task = Task::new("t1", "code_generation", 5);
        store.put_task(&task).unwrap();
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some("a1".to_string());
        store.put_task(&task).unwrap();
        let loaded = store.get_task("t1").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.assigned_agent.as_deref(), Some("a1"));
    }

    #[test]
    fn pattern_upsert_is_idempotent_on_conflict() {
        let store = Store::open_in_memory().unwrap();
        let pattern = Pattern {
            fingerprint: "abc123".to_string(),
            success_rate: 0.5,
            sample_count: 2,
            last_updated: Utc::now(),
        };
        store.upsert_pattern(&pattern).unwrap();
        let mut updated = pattern.clone();
        updated.success_rate = 0.75;
        updated.sample_count = 4;
        store.upsert_pattern(&updated).unwrap();
        let loaded = store.get_pattern("abc123").unwrap().unwrap();
        assert_eq!(loaded.sample_count, 4);
        assert_eq!(loaded.success_rate, 0.75);
    }

    #[test]
    fn snapshot_round_trip_returns_latest() {
        let store = Store::open_in_memory().unwrap();
        let first = MemorySnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            agent_id: "a1".to_string(),
            kind: SnapshotKind::Checkpoint,
            payload: b"old".to_vec(),
            created_at: Utc::now() - chrono::Duration::seconds(10),
        };
        let second = MemorySnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            agent_id: "a1".to_string(),
            kind: SnapshotKind::Sleep,
            payload: b"new".to_vec(),
            created_at: Utc::now(),
        };
        store.put_snapshot(&first).unwrap();
        store.put_snapshot(&second).unwrap();
        let latest = store.latest_snapshot("a1").unwrap().unwrap();
        assert_eq!(latest.payload, b"new");
    }

    #[test]
    fn cleanup_deletes_only_old_decisions() {
        let store = Store::open_in_memory().unwrap();
        let old = Decision {
            id: "d1".to_string(),
            context_fingerprint: "fp".to_string(),
            agent_confidence: 0.8,
            external_confidence: 0.8,
            human_involved: false,
            outcome: Outcome::Success,
            recorded_at: Utc::now() - chrono::Duration::days(40),
        };
        let recent = Decision {
            id: "d2".to_string(),
            recorded_at: Utc::now(),
            ..old.clone()
        };
        store.insert_decision(&old).unwrap();
        store.insert_decision(&recent).unwrap();
        let deleted = store.cleanup_decisions_older_than(30).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.decisions_for_fingerprint("fp").unwrap().len(), 1);
    }
}
