//! In-memory registry of the workflows an engine owns.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use flowpilot_core::{Workflow, WorkflowSummary};

use crate::error::{OrchestratorError, Result};

#[derive(Debug)]
pub(crate) struct Entry {
    pub workflow: Workflow,
    /// A driver task is currently executing batches for this workflow.
    pub driver_active: bool,
    /// Cancel once the driver's current batch has drained.
    pub cancel_requested: bool,
    finished_at: Option<Instant>,
}

/// Workflows keyed by id. Terminal workflows stay queryable for the
/// retention window and are dropped by `prune_expired`.
#[derive(Debug)]
pub struct WorkflowStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
    retention: Duration,
}

impl WorkflowStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn insert(&self, workflow: Workflow) -> Uuid {
        let id = workflow.id;
        let finished_at = workflow.status.is_terminal().then(Instant::now);
        self.write().insert(
            id,
            Entry {
                workflow,
                driver_active: false,
                cancel_requested: false,
                finished_at,
            },
        );
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Workflow> {
        self.read().get(&id).map(|e| e.workflow.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read().contains_key(&id)
    }

    /// Apply `f` to the workflow under the write lock.
    pub fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut Workflow) -> T) -> Result<T> {
        self.update_entry(id, |entry| f(&mut entry.workflow))
    }

    pub(crate) fn update_entry<T>(&self, id: Uuid, f: impl FnOnce(&mut Entry) -> T) -> Result<T> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(&id)
            .ok_or(OrchestratorError::WorkflowNotFound(id))?;
        let out = f(entry);
        if entry.workflow.status.is_terminal() {
            entry.finished_at.get_or_insert_with(Instant::now);
            entry.driver_active = false;
        }
        Ok(out)
    }

    /// Summaries ordered by creation time.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> =
            self.read().values().map(|e| e.workflow.summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Drop terminal workflows older than the retention window.
    pub fn prune_expired(&self) -> usize {
        let retention = self.retention;
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| e.finished_at.map_or(true, |at| at.elapsed() < retention));
        before - entries.len()
    }

    pub fn remove(&self, id: Uuid) -> Option<Workflow> {
        self.write().remove(&id).map(|e| e.workflow)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
