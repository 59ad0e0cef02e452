//! Subagent task data model.
//!
//! A `SubagentTask` is one unit of work inside an orchestration (generate
//! the frontend, write the tests, ...). It tracks its lifecycle status,
//! the opaque context handed to the task runner, the runner's output and
//! write-once resource accounting.

use crate::core::orchestration::{OrchestrationId, RequestId};
use crate::core::output::TaskOutput;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

uuid_id!(
    /// Unique identifier for a subagent task.
    TaskId
);

/// Kind of work a task performs.
///
/// The scheduler never branches on this; it is carried through to the
/// task runner (prompt selection) and to the UI. Unknown kinds are kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Schema,
    Backend,
    Frontend,
    Tests,
    Docs,
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Schema => "schema",
            TaskType::Backend => "backend",
            TaskType::Frontend => "frontend",
            TaskType::Tests => "tests",
            TaskType::Docs => "docs",
            TaskType::Other(s) => s,
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "schema" => TaskType::Schema,
            "backend" => TaskType::Backend,
            "frontend" => TaskType::Frontend,
            "tests" | "test" => TaskType::Tests,
            "docs" | "documentation" => TaskType::Docs,
            _ => TaskType::Other(value),
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        TaskType::from(value.to_string())
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Running -> Completed | Failed`. Terminal states are never
/// left; there is no task-level retry once the runner has reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single subagent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTask {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Orchestration this task belongs to.
    pub orchestration_id: OrchestrationId,
    /// Development request that owns the orchestration.
    pub request_id: RequestId,
    /// Creation order within the orchestration; the dispatch tie-break.
    pub sequence: usize,
    /// Plan key the task was built from (unique within the plan).
    pub key: String,
    pub task_type: TaskType,
    pub name: String,
    pub description: String,
    /// Tasks that must be completed before this one may start.
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    /// Input payload for the task runner. Opaque to the scheduler.
    pub context: serde_json::Value,
    /// Runner output once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of dispatch attempts made for this task.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
}

impl SubagentTask {
    /// Create a pending task. Dependencies are attached by the graph builder.
    pub fn new(
        orchestration_id: OrchestrationId,
        request_id: RequestId,
        sequence: usize,
        key: &str,
        task_type: TaskType,
        name: &str,
        description: &str,
    ) -> Self {
        Self {
            id: TaskId::new(),
            orchestration_id,
            request_id,
            sequence,
            key: key.to_string(),
            task_type,
            name: name.to_string(),
            description: description.to_string(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            context: serde_json::Value::Null,
            output: None,
            error_message: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            tokens_used: None,
        }
    }

    /// Attach the runner context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Transition `Pending -> Running` and stamp the start time.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid_transition(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    /// Transition `Running -> Completed`, recording output and accounting.
    pub fn complete(&mut self, output: TaskOutput, at: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid_transition(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.tokens_used = Some(output.tokens_used);
        self.output = Some(output);
        self.finish_clock(at);
        Ok(())
    }

    /// Transition `Running -> Failed`, recording the error message.
    pub fn fail(&mut self, error: &str, at: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.invalid_transition(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.to_string());
        self.tokens_used.get_or_insert(0);
        self.finish_clock(at);
        Ok(())
    }

    fn finish_clock(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.duration_ms = self
            .started_at
            .map(|started| (at - started).num_milliseconds().max(0) as u64);
    }

    fn invalid_transition(&self, to: TaskStatus) -> Error {
        Error::Validation(format!(
            "task {} cannot move from {} to {}",
            self.id, self.status, to
        ))
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
