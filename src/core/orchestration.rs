//! Orchestration record: one coordination run for a development request.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

uuid_id!(
    /// Unique identifier for an orchestration.
    OrchestrationId
);

/// Identifier of the development request that owns an orchestration.
///
/// Request ids come from the caller and are free-form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot-able orchestration state. Mutated only by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orchestration {
    pub id: OrchestrationId,
    pub request_id: RequestId,
    pub status: OrchestrationStatus,
    /// Set when the orchestration failed because it was cancelled.
    #[serde(default)]
    pub cancelled: bool,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Concurrency limit this run dispatches under.
    pub max_concurrency: usize,
    /// task id -> ids it depends on. Fixed once built.
    pub dependency_graph: BTreeMap<TaskId, Vec<TaskId>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Orchestration {
    pub fn new(
        id: OrchestrationId,
        request_id: RequestId,
        dependency_graph: BTreeMap<TaskId, Vec<TaskId>>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            id,
            request_id,
            status: OrchestrationStatus::Pending,
            cancelled: false,
            total_tasks: dependency_graph.len(),
            completed_tasks: 0,
            failed_tasks: 0,
            max_concurrency,
            dependency_graph,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_duration_ms: None,
            failure_reason: None,
        }
    }

    /// `pending -> running`.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != OrchestrationStatus::Pending {
            return Err(Error::Validation(format!(
                "orchestration {} cannot start from {}",
                self.id, self.status
            )));
        }
        self.status = OrchestrationStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    pub fn record_completed(&mut self) -> Result<()> {
        self.check_room()?;
        self.completed_tasks += 1;
        Ok(())
    }

    pub fn record_failed(&mut self) -> Result<()> {
        self.check_room()?;
        self.failed_tasks += 1;
        Ok(())
    }

    fn check_room(&self) -> Result<()> {
        if self.finished_tasks() >= self.total_tasks {
            return Err(Error::Validation(format!(
                "orchestration {} already accounted for all {} tasks",
                self.id, self.total_tasks
            )));
        }
        Ok(())
    }

    pub fn finished_tasks(&self) -> usize {
        self.completed_tasks + self.failed_tasks
    }

    /// Mark as failed by cancellation. Returns false if already terminal.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrchestrationStatus::Failed;
        self.cancelled = true;
        self.failure_reason = Some("cancelled".to_string());
        self.stamp_end(at);
        true
    }

    /// Mark a run that was still active when the process stopped.
    pub fn interrupt(&mut self, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrchestrationStatus::Failed;
        self.failure_reason = Some("interrupted".to_string());
        self.stamp_end(at);
        true
    }

    /// Settle the terminal status once nothing can run anymore.
    ///
    /// A cancelled orchestration keeps its `failed` status; only the
    /// duration is refreshed so it covers drained in-flight tasks.
    pub fn finalize(&mut self, at: DateTime<Utc>) {
        if !self.cancelled {
            if self.failed_tasks == 0 && self.completed_tasks == self.total_tasks {
                self.status = OrchestrationStatus::Completed;
            } else {
                self.status = OrchestrationStatus::Failed;
                if self.failure_reason.is_none() {
                    self.failure_reason = Some(format!(
                        "{} of {} tasks failed",
                        self.failed_tasks, self.total_tasks
                    ));
                }
            }
        }
        self.stamp_end(at);
    }

    fn stamp_end(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        let from = self.started_at.unwrap_or(self.created_at);
        self.total_duration_ms = Some((at - from).num_milliseconds().max(0) as u64);
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Derived metrics reported next to the orchestration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSummary {
    pub orchestration: Orchestration,
    /// Sum of every finished task's duration.
    pub sequential_duration_ms: u64,
    /// `sequentialDurationMs / totalDurationMs`, when both are known.
    pub speedup: Option<f64>,
    pub peak_concurrency: usize,
    pub total_tokens: u64,
    pub blocked_tasks: Vec<TaskId>,
    pub unresolved_conflicts: usize,
}

impl OrchestrationSummary {
    pub fn speedup(sequential_ms: u64, total_ms: Option<u64>) -> Option<f64> {
        match total_ms {
            Some(total) if total > 0 && sequential_ms > 0 => {
                Some(sequential_ms as f64 / total as f64)
            }
            _ => None,
        }
    }
}
