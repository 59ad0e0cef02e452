//! Coordinator-owned state for one orchestration, and the read-only views
//! derived from it.

use crate::core::orchestration::OrchestrationSummary;
use crate::core::{
    ConflictId, MergeConflict, Orchestration, OrchestrationId, SubagentTask, TaskDAG, TaskId,
    TaskStatus,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the coordinator mutates. Readers only ever get clones.
#[derive(Debug)]
pub struct OrchestrationState {
    pub orchestration: Orchestration,
    pub dag: TaskDAG,
    pub conflicts: Vec<MergeConflict>,
    pub peak_concurrency: usize,
}

impl OrchestrationState {
    pub fn new(orchestration: Orchestration, dag: TaskDAG) -> Self {
        Self {
            orchestration,
            dag,
            conflicts: Vec::new(),
            peak_concurrency: 0,
        }
    }

    pub fn id(&self) -> OrchestrationId {
        self.orchestration.id
    }

    /// Task snapshots in creation order.
    pub fn tasks(&self) -> Vec<SubagentTask> {
        self.dag.all_tasks().into_iter().cloned().collect()
    }

    pub fn conflict_mut(&mut self, id: &ConflictId) -> Result<&mut MergeConflict> {
        self.conflicts
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))
    }

    pub fn summary(&self) -> OrchestrationSummary {
        let tasks = self.dag.all_tasks();
        let sequential_duration_ms = tasks.iter().filter_map(|t| t.duration_ms).sum();
        OrchestrationSummary {
            orchestration: self.orchestration.clone(),
            sequential_duration_ms,
            speedup: OrchestrationSummary::speedup(
                sequential_duration_ms,
                self.orchestration.total_duration_ms,
            ),
            peak_concurrency: self.peak_concurrency,
            total_tokens: tasks.iter().filter_map(|t| t.tokens_used).sum(),
            blocked_tasks: self.dag.blocked_tasks().iter().map(|t| t.id).collect(),
            unresolved_conflicts: self.conflicts.iter().filter(|c| !c.is_resolved()).count(),
        }
    }

    /// Every generated file with the tasks that produced it.
    pub fn results(&self) -> OrchestrationResults {
        let mut files: BTreeMap<String, FileResult> = BTreeMap::new();
        let completed = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed);

        for task in completed {
            let Some(output) = task.output.as_ref() else {
                continue;
            };
            for file in &output.files {
                let entry = files
                    .entry(crate::core::output::normalize_path(&file.path))
                    .or_insert_with_key(|path| FileResult {
                        path: path.clone(),
                        language: None,
                        content_length: 0,
                        contributors: Vec::new(),
                        conflicted: false,
                    });
                if !entry.contributors.contains(&task.id) {
                    entry.contributors.push(task.id);
                }
                entry.language = entry.language.take().or_else(|| file.language.clone());
                entry.content_length = entry.content_length.max(file.content.len());
            }
        }

        for conflict in &self.conflicts {
            if let Some(file) = files.get_mut(&conflict.file_path) {
                file.conflicted = true;
            }
        }

        OrchestrationResults {
            orchestration_id: self.orchestration.id,
            status: self.orchestration.status,
            files: files.into_values().collect(),
            total_conflicts: self.conflicts.len(),
            unresolved_conflicts: self.conflicts.iter().filter(|c| !c.is_resolved()).count(),
        }
    }

    /// Settle a record whose coordinator died mid-run: running tasks fail,
    /// the orchestration fails with reason `interrupted`.
    pub fn interrupt(&mut self, at: DateTime<Utc>) -> bool {
        if !self.orchestration.is_active() {
            return false;
        }
        let running: Vec<TaskId> = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id)
            .collect();
        for id in running {
            if let Some(task) = self.dag.get_task_mut(&id) {
                if task.fail("interrupted", at).is_ok() {
                    let _ = self.orchestration.record_failed();
                }
            }
        }
        self.orchestration.interrupt(at)
    }

    pub fn to_record(&self) -> OrchestrationRecord {
        OrchestrationRecord {
            orchestration: self.orchestration.clone(),
            tasks: self.tasks(),
            conflicts: self.conflicts.clone(),
            peak_concurrency: self.peak_concurrency,
        }
    }

    pub fn from_record(record: OrchestrationRecord) -> Result<Self> {
        let dag = TaskDAG::from_tasks(record.tasks)?;
        Ok(Self {
            orchestration: record.orchestration,
            dag,
            conflicts: record.conflicts,
            peak_concurrency: record.peak_concurrency,
        })
    }
}

/// Aggregated output of an orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResults {
    pub orchestration_id: OrchestrationId,
    pub status: crate::core::OrchestrationStatus,
    pub files: Vec<FileResult>,
    pub total_conflicts: usize,
    pub unresolved_conflicts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content_length: usize,
    /// Tasks that wrote this file, in creation order.
    pub contributors: Vec<TaskId>,
    pub conflicted: bool,
}

/// Persisted shape: one orchestration with its task and conflict tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRecord {
    pub orchestration: Orchestration,
    pub tasks: Vec<SubagentTask>,
    pub conflicts: Vec<MergeConflict>,
    #[serde(default)]
    pub peak_concurrency: usize,
}
