//! Priority heap + dependency graph over tasks in `{Pending, WaitingDependency,
//! Assigned, InProgress}`. Generalizes the teacher's `TaskQueue` service
//! (a flat `Vec` sorted on insert) into a binary-heap-backed structure with
//! a dependency index, matching the state machine in SPEC_FULL.md §4.3.

use crate::models::{Task, TaskStatus};
use crate::store::Store;
use crate::{FleetError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
    QueueFull,
}

struct RankedTask(Task);

impl PartialEq for RankedTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for RankedTask {}

impl Ord for RankedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
    }
}
impl PartialOrd for RankedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    pending: BinaryHeap<RankedTask>,
    waiting_dependency: HashSet<String>,
    /// Full dependency graph (child -> parents), kept regardless of
    /// resolution state, used for cycle detection.
    deps_of: HashMap<String, HashSet<String>>,
    /// Unresolved parents only; a task moves out of `waiting_dependency`
    /// once this set empties.
    unresolved: HashMap<String, HashSet<String>>,
    dependents: HashMap<String, HashSet<String>>,
    known_ids: HashSet<String>,
}

pub struct TaskQueue {
    store: Arc<Store>,
    max_size: usize,
    state: Mutex<State>,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>, max_size: usize) -> Self {
        Self {
            store,
            max_size,
            state: Mutex::new(State {
                pending: BinaryHeap::new(),
                waiting_dependency: HashSet::new(),
                deps_of: HashMap::new(),
                unresolved: HashMap::new(),
                dependents: HashMap::new(),
                known_ids: HashSet::new(),
            }),
        }
    }

    /// Reloads in-memory indices from `Store` on startup, since `Store` is
    /// the single source of truth and the queue only caches derived state.
    pub async fn rehydrate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for status in [
            TaskStatus::Pending,
            TaskStatus::WaitingDependency,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
        ] {
            for task in self.store.list_tasks_by_status(status)? {
                state.known_ids.insert(task.id.clone());
                state
                    .deps_of
                    .insert(task.id.clone(), task.dependencies.clone());
                for parent in &task.dependencies {
                    state
                        .dependents
                        .entry(parent.clone())
                        .or_default()
                        .insert(task.id.clone());
                }
                match status {
                    TaskStatus::Pending => state.pending.push(RankedTask(task)),
                    TaskStatus::WaitingDependency => {
                        let unresolved: HashSet<String> = task
                            .dependencies
                            .iter()
                            .filter(|p| {
                                self.store
                                    .get_task(p)
                                    .ok()
                                    .flatten()
                                    .map(|t| t.status != TaskStatus::Completed)
                                    .unwrap_or(true)
                            })
                            .cloned()
                            .collect();
                        state.unresolved.insert(task.id.clone(), unresolved);
                        state.waiting_dependency.insert(task.id);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn has_cycle(state: &State, new_id: &str, dependencies: &HashSet<String>) -> bool {
        let mut stack: Vec<String> = dependencies.iter().cloned().collect();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == new_id {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(parents) = state.deps_of.get(&current) {
                stack.extend(parents.iter().cloned());
            }
        }
        false
    }

    pub async fn add(&self, task: Task) -> Result<AddOutcome> {
        let mut state = self.state.lock().await;
        if state.known_ids.contains(&task.id) {
            return Ok(AddOutcome::Duplicate);
        }
        if state.known_ids.len() >= self.max_size {
            return Ok(AddOutcome::QueueFull);
        }
        if Self::has_cycle(&state, &task.id, &task.dependencies) {
            return Err(FleetError::Validation(format!(
                "task {} has a cyclic dependency",
                task.id
            )));
        }

        state.known_ids.insert(task.id.clone());
        state
            .deps_of
            .insert(task.id.clone(), task.dependencies.clone());
        for parent in &task.dependencies {
            state
                .dependents
                .entry(parent.clone())
                .or_default()
                .insert(task.id.clone());
        }

        let unresolved: HashSet<String> = task
            .dependencies
            .iter()
            .filter(|parent_id| {
                !matches!(
                    self.store.get_task(parent_id).ok().flatten().map(|t| t.status),
                    Some(TaskStatus::Completed)
                )
            })
            .cloned()
            .collect();

        let mut stored = task.clone();
        if unresolved.is_empty() {
            stored.status = TaskStatus::Pending;
            self.store.put_task(&stored)?;
            state.pending.push(RankedTask(stored));
        } else {
            stored.status = TaskStatus::WaitingDependency;
            self.store.put_task(&stored)?;
            state.unresolved.insert(task.id.clone(), unresolved);
            state.waiting_dependency.insert(task.id.clone());
        }

        Ok(AddOutcome::Added)
    }

    /// Highest-priority task matching `capabilities` whose dependencies are
    /// met, attempts remain, and deadline (if any) has not passed.
    pub async fn next(
        &self,
        capabilities: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        if capabilities.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.lock().await;
        let mut deferred = Vec::new();
        let mut chosen = None;

        while let Some(RankedTask(task)) = state.pending.pop() {
            let eligible = capabilities.contains(&task.task_type)
                && task.attempts < task.max_attempts
                && task.deadline.map(|d| d >= now).unwrap_or(true);
            if eligible {
                chosen = Some(task);
                break;
            }
            deferred.push(RankedTask(task));
        }
        for item in deferred {
            state.pending.push(item);
        }

        let Some(mut task) = chosen else {
            return Ok(None);
        };
        task.status = TaskStatus::Assigned;
        self.store.put_task(&task)?;
        Ok(Some(task))
    }

    pub async fn mark_in_progress(&self, id: &str, agent_id: &str) -> Result<()> {
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))?;
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some(agent_id.to_string());
        task.started_at = Some(Utc::now());
        self.store.put_task(&task)?;
        Ok(())
    }

    /// Idempotent: a second call on an already-`Completed` task is a no-op.
    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))?;
        if task.status == TaskStatus::Completed {
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.assigned_agent = None;
        self.store.put_task(&task)?;
        self.release_dependents(id).await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, can_retry: bool) -> Result<()> {
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))?;
        task.attempts += 1;
        if can_retry && task.attempts < task.max_attempts {
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            self.store.put_task(&task)?;
            let mut state = self.state.lock().await;
            state.pending.push(RankedTask(task));
        } else {
            task.status = TaskStatus::Failed;
            self.store.put_task(&task)?;
        }
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))?;
        if !matches!(
            task.status,
            TaskStatus::Pending
                | TaskStatus::WaitingDependency
                | TaskStatus::Assigned
                | TaskStatus::InProgress
        ) {
            return Err(FleetError::InvariantViolation(format!(
                "cannot cancel task {id} in status {:?}",
                task.status
            )));
        }
        task.status = TaskStatus::Cancelled;
        self.store.put_task(&task)?;
        let mut state = self.state.lock().await;
        state.pending = state
            .pending
            .drain()
            .filter(|t| t.0.id != id)
            .collect();
        Ok(())
    }

    /// Tasks in `InProgress` whose `started_at + timeout_seconds < now`.
    pub async fn timed_out(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let in_progress = self.store.list_tasks_by_status(TaskStatus::InProgress)?;
        Ok(in_progress
            .into_iter()
            .filter(|task| match (task.started_at, task.timeout_seconds) {
                (Some(started), Some(timeout)) => {
                    started + chrono::Duration::seconds(timeout) < now
                }
                _ => false,
            })
            .collect())
    }

    async fn release_dependents(&self, completed_id: &str) -> Result<()> {
        let children = {
            let state = self.state.lock().await;
            state
                .dependents
                .get(completed_id)
                .cloned()
                .unwrap_or_default()
        };
        for child_id in children {
            let mut state = self.state.lock().await;
            let mut ready = false;
            if let Some(unresolved) = state.unresolved.get_mut(&child_id) {
                unresolved.remove(completed_id);
                ready = unresolved.is_empty();
            }
            drop(state);

            if ready {
                let mut child = self
                    .store
                    .get_task(&child_id)?
                    .ok_or_else(|| FleetError::NotFound(format!("task {child_id}")))?;
                if child.status == TaskStatus::WaitingDependency {
                    child.status = TaskStatus::Pending;
                    self.store.put_task(&child)?;
                    let mut state = self.state.lock().await;
                    state.waiting_dependency.remove(&child_id);
                    state.unresolved.remove(&child_id);
                    state.pending.push(RankedTask(child));
                    debug!(task_id = %child_id, "dependency satisfied, task moved to pending");
                }
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.known_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn caps(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn next_prefers_priority_then_age() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 100);
        queue.add(Task::new("low", "code_generation", 1)).await.unwrap();
        queue.add(Task::new("high", "code_generation", 9)).await.unwrap();
        let next = queue
            .next(&caps(&["code_generation"]), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "high");
    }

    #[tokio::test]
    async fn dependency_gating_blocks_child_until_parent_completes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 100);
        queue
            .add(Task::new("parent", "code_generation", 3))
            .await
            .unwrap();
        let mut child = Task::new("child", "code_generation", 10);
        child.dependencies.insert("parent".to_string());
        queue.add(child).await.unwrap();

        let first = queue
            .next(&caps(&["code_generation"]), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "parent");

        assert!(queue
            .next(&caps(&["code_generation"]), Utc::now())
            .await
            .unwrap()
            .is_none());

        queue.mark_completed("parent").await.unwrap();
        let second = queue
            .next(&caps(&["code_generation"]), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, "child");
    }

    #[tokio::test]
    async fn cyclic_dependency_is_rejected() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 100);
        let mut a = Task::new("a", "code_generation", 1);
        a.dependencies.insert("b".to_string());
        let mut b = Task::new("b", "code_generation", 1);
        b.dependencies.insert("a".to_string());
        queue.add(a).await.unwrap();
        let result = queue.add(b).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 1);
        queue.add(Task::new("a", "code_generation", 1)).await.unwrap();
        let outcome = queue.add(Task::new("b", "code_generation", 1)).await.unwrap();
        assert_eq!(outcome, AddOutcome::QueueFull);
    }

    #[tokio::test]
    async fn empty_capabilities_returns_none() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 100);
        queue.add(Task::new("a", "code_generation", 1)).await.unwrap();
        let result = queue.next(&HashSet::new(), Utc::now()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), 100);
        queue.add(Task::new("a", "code_generation", 1)).await.unwrap();
        queue.mark_in_progress("a", "agent-1").await.unwrap();
        queue.mark_completed("a").await.unwrap();
        queue.mark_completed("a").await.unwrap();
        let task = store.get_task("a").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
