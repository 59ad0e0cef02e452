//! Task runner adapter.
//!
//! The coordinator hands every dispatched task to a [`TaskRunner`] and only
//! sees the outcome: a [`TaskOutput`] or a [`RunnerError`]. The bundled
//! [`CommandRunner`] shells out to a headless code-generation CLI (by
//! default `claude -p`) with a prompt built from the task type.

use crate::config::RunnerConfig;
use crate::core::{SubagentTask, TaskOutput, TaskType};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Runner outcome other than success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    /// The runner could not be reached. Retried by the dispatch policy.
    #[error("runner unavailable: {0}")]
    Unavailable(String),
    /// The task ran and failed. Terminal for the task.
    #[error("{0}")]
    Failed(String),
}

impl RunnerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::Unavailable(_))
    }
}

/// Executes one subagent task.
///
/// Implementations should watch `cancel` and return early when it fires;
/// whatever they return afterwards is still recorded.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        task: &SubagentTask,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, RunnerError>;
}

/// Bounded retry with linear backoff for dispatch errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// Run `task`, retrying `Unavailable` outcomes. Returns the final
    /// outcome and the number of attempts made.
    pub async fn run(
        &self,
        runner: &Arc<dyn TaskRunner>,
        task: &SubagentTask,
        cancel: &CancellationToken,
    ) -> (Result<TaskOutput, RunnerError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = runner.run(task, cancel.child_token()).await;
            match outcome {
                Err(err) if err.is_retryable() && attempt <= self.retries => {
                    let delay = self.backoff * attempt;
                    warn!(
                        task_id = %task.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "dispatch failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return (Err(RunnerError::Failed("cancelled".into())), attempt);
                        }
                    }
                }
                Err(RunnerError::Unavailable(msg)) => {
                    return (
                        Err(RunnerError::Failed(format!(
                            "runner unavailable after {} attempts: {}",
                            attempt, msg
                        ))),
                        attempt,
                    );
                }
                other => return (other, attempt),
            }
        }
    }
}

/// Runs tasks through an external headless CLI.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        let mut parts = config.command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "claude".to_string());
        Self {
            program,
            args: parts.collect(),
            timeout: config.timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resolve_binary(&self) -> Result<PathBuf, RunnerError> {
        which::which(&self.program)
            .map_err(|e| RunnerError::Unavailable(format!("{}: {}", self.program, e)))
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(
        &self,
        task: &SubagentTask,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, RunnerError> {
        let binary = self.resolve_binary()?;
        let prompt = build_prompt(task);
        debug!(task_id = %task.id, binary = %binary.display(), "spawning runner");

        let mut command = Command::new(&binary);
        command
            .args(&self.args)
            .arg(&prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| RunnerError::Unavailable(format!("spawn {}: {}", binary.display(), e)))?;

        // Dropping the wait future drops the child, and kill_on_drop reaps it.
        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(RunnerError::Failed(format!("runner io error: {}", e))),
                    Err(_) => {
                        return Err(RunnerError::Failed(format!(
                            "timed out after {}s",
                            self.timeout.as_secs()
                        )))
                    }
                }
            }
            _ = cancel.cancelled() => {
                return Err(RunnerError::Failed("cancelled".into()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!(task_id = %task.id, bytes = stdout.len(), "runner output");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "runner exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(RunnerError::Failed(message));
        }

        Ok(TaskOutput::parse(&stdout))
    }
}

/// Prompt for one task, specialized by task type.
pub fn build_prompt(task: &SubagentTask) -> String {
    let request = &task.context["request"];
    let description = request["description"].as_str().unwrap_or("");
    let framework = request["framework"].as_str().unwrap_or("Not specified");
    let category = request["category"].as_str().unwrap_or("Not specified");

    let (title, focus) = match &task.task_type {
        TaskType::Schema => (
            "Database Schema Design",
            "Design entities with keys, relationships, indexes and constraints. \
             Other agents build on this schema, keep it small and consistent.",
        ),
        TaskType::Backend => (
            "Backend API Implementation",
            "Implement endpoints, services and data access. Declare every endpoint \
             you expose with its request and response shape.",
        ),
        TaskType::Frontend => (
            "Frontend Implementation",
            "Build components, pages, routing and the API client. Consume endpoints \
             exactly as the backend declares them.",
        ),
        TaskType::Tests => (
            "Test Suite",
            "Write unit and integration tests for the generated frontend and backend.",
        ),
        TaskType::Docs => (
            "Documentation",
            "Write the README, API reference and deployment notes.",
        ),
        TaskType::Other(_) => ("Development Task", "Complete the task described below."),
    };

    let mut prompt = format!(
        "# {title}: {name}\n\n\
         ## Project Context\n\
         - **Description**: {description}\n\
         - **Framework**: {framework}\n\
         - **Category**: {category}\n\n\
         ## Your Task\n{task_description}\n\n\
         ## Focus\n{focus}\n",
        title = title,
        name = task.name,
        description = description,
        framework = framework,
        category = category,
        task_description = task.description,
        focus = focus,
    );

    let extra = &task.context["task"];
    if !extra.is_null() {
        prompt.push_str("\n## Additional Context\n");
        prompt.push_str(&extra.to_string());
        prompt.push('\n');
    }

    prompt.push_str(
        "\n## Output Format\n\
         Write every file as a `### path/to/file` heading followed by a fenced code block.\n",
    );
    prompt
}
