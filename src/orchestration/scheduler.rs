//! Scheduler for parallel subagent execution.
//!
//! One `Scheduler` coordinates one orchestration. It runs as a single tokio
//! task that owns every mutation of the orchestration, task and conflict
//! records. Runner results, cancellation and conflict actions all arrive
//! through one intake channel and are handled strictly one at a time, so
//! callers only ever observe consistent snapshots.
//!
//! Callers talk to a running scheduler through an [`OrchestrationHandle`].
//! Once the orchestration has finalized the scheduler task is gone and the
//! handle applies conflict actions to the state directly.

use crate::core::{
    ConflictId, MergeConflict, Orchestration, OrchestrationId, OrchestrationStatus, RequestId,
    SubagentTask, TaskId, TaskOutput,
};
use crate::error::{Error, Result};
use crate::orchestration::builder::BuiltGraph;
use crate::orchestration::detector::ConflictDetector;
use crate::orchestration::events::{EventKind, EventPublisher, EventReceiver};
use crate::orchestration::resolver::{ConflictResolver, ResolveOutcome};
use crate::orchestration::runner::{RetryPolicy, RunnerError, TaskRunner};
use crate::orchestration::state::{OrchestrationResults, OrchestrationState};
use crate::orchestration::store::JsonStore;
use crate::core::orchestration::OrchestrationSummary;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A conflict operation requested by a caller.
#[derive(Debug, Clone)]
pub enum ConflictAction {
    Resolve { auto: bool },
    AcceptManual { content: String },
}

/// Messages serialized into the coordinator.
enum Command {
    TaskFinished {
        task_id: TaskId,
        outcome: std::result::Result<TaskOutput, RunnerError>,
        attempts: u32,
    },
    Cancel {
        reply: oneshot::Sender<Orchestration>,
    },
    Conflict {
        conflict_id: ConflictId,
        action: ConflictAction,
        reply: oneshot::Sender<Result<MergeConflict>>,
    },
}

/// The per-orchestration coordinator.
pub struct Scheduler {
    state: Arc<RwLock<OrchestrationState>>,
    events: Arc<EventPublisher>,
    runner: Arc<dyn TaskRunner>,
    retry: RetryPolicy,
    detector: ConflictDetector,
    cancel: CancellationToken,
    intake_tx: mpsc::UnboundedSender<Command>,
    intake_rx: mpsc::UnboundedReceiver<Command>,
    finished: watch::Sender<bool>,
    store: Option<JsonStore>,
}

impl Scheduler {
    /// Move a freshly built orchestration to `running` and spawn its
    /// coordinator. Must be called inside a tokio runtime.
    ///
    /// The returned receiver is attached before the first event, so it sees
    /// the whole stream. Dropping it is fine.
    pub fn start(
        built: BuiltGraph,
        runner: Arc<dyn TaskRunner>,
        retry: RetryPolicy,
        store: Option<JsonStore>,
    ) -> Result<(OrchestrationHandle, EventReceiver)> {
        let BuiltGraph {
            mut orchestration,
            dag,
        } = built;
        orchestration.start(Utc::now())?;

        let events = Arc::new(EventPublisher::new());
        let receiver = events.subscribe();
        events.publish(EventKind::OrchestrationStatus {
            orchestration: orchestration.clone(),
            message: format!(
                "Orchestration started with {} tasks",
                orchestration.total_tasks
            ),
        });
        info!(
            orchestration_id = %orchestration.id,
            request_id = %orchestration.request_id,
            tasks = orchestration.total_tasks,
            max_concurrency = orchestration.max_concurrency,
            "orchestration started"
        );

        let id = orchestration.id;
        let request_id = orchestration.request_id.clone();
        let state = Arc::new(RwLock::new(OrchestrationState::new(orchestration, dag)));
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (finished, finished_rx) = watch::channel(false);

        let handle = OrchestrationHandle {
            id,
            request_id,
            state: Arc::clone(&state),
            events: Arc::clone(&events),
            commands: intake_tx.clone(),
            finished: finished_rx,
            store: store.clone(),
        };

        let scheduler = Scheduler {
            state,
            events,
            runner,
            retry,
            detector: ConflictDetector::new(),
            cancel: CancellationToken::new(),
            intake_tx,
            intake_rx,
            finished,
            store,
        };
        tokio::spawn(scheduler.run());

        Ok((handle, receiver))
    }

    /// Main coordination loop.
    async fn run(mut self) {
        self.dispatch_ready().await;

        while !self.is_settled().await {
            // Never None: the scheduler holds a sender itself.
            let Some(command) = self.intake_rx.recv().await else {
                break;
            };
            self.handle_command(command).await;
            self.dispatch_ready().await;
        }

        self.finalize().await;
    }

    /// Nothing running, and nothing left that may start.
    async fn is_settled(&self) -> bool {
        let state = self.state.read().await;
        if state.dag.running_count() > 0 {
            return false;
        }
        !state.orchestration.is_active() || state.dag.ready_tasks().is_empty()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::TaskFinished {
                task_id,
                outcome,
                attempts,
            } => self.handle_task_finished(task_id, outcome, attempts).await,
            Command::Cancel { reply } => {
                let snapshot = self.handle_cancel().await;
                let _ = reply.send(snapshot);
            }
            Command::Conflict {
                conflict_id,
                action,
                reply,
            } => {
                let mut state = self.state.write().await;
                let result =
                    apply_conflict_action(&mut state, &self.events, &conflict_id, action, Utc::now());
                let _ = reply.send(result);
            }
        }
    }

    /// Start ready tasks in creation order until the concurrency limit is hit.
    async fn dispatch_ready(&mut self) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.orchestration.status != OrchestrationStatus::Running {
            return;
        }
        let limit = state.orchestration.max_concurrency.max(1);

        loop {
            let running = state.dag.running_count();
            if running >= limit {
                break;
            }
            let Some(task_id) = state.dag.ready_tasks().first().map(|t| t.id) else {
                break;
            };
            let Some(task) = state.dag.get_task_mut(&task_id) else {
                break;
            };
            if let Err(err) = task.start(Utc::now()) {
                error!(task_id = %task_id, error = %err, "ready task refused to start");
                break;
            }
            let snapshot = task.clone();
            state.peak_concurrency = state.peak_concurrency.max(running + 1);

            info!(
                orchestration_id = %state.orchestration.id,
                task_id = %snapshot.id,
                task_type = %snapshot.task_type,
                running = running + 1,
                "dispatching task"
            );
            self.events.publish(EventKind::TaskUpdate {
                message: format!("Task {} started", snapshot.name),
                task: snapshot.clone(),
            });

            spawn_runner(
                Arc::clone(&self.runner),
                self.retry,
                self.cancel.child_token(),
                self.intake_tx.clone(),
                snapshot,
            );
        }
    }

    /// Record a runner outcome, publish it, and look for new conflicts.
    async fn handle_task_finished(
        &mut self,
        task_id: TaskId,
        outcome: std::result::Result<TaskOutput, RunnerError>,
        attempts: u32,
    ) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let now = Utc::now();
        let orchestration_id = state.orchestration.id;

        let Some(task) = state.dag.get_task_mut(&task_id) else {
            error!(task_id = %task_id, "completion for unknown task");
            return;
        };
        task.attempts = attempts;

        let (transition, succeeded, message) = match outcome {
            Ok(output) => {
                let transition = task.complete(output, now);
                let message = format!(
                    "Task {} completed in {}ms",
                    task.name,
                    task.duration_ms.unwrap_or(0)
                );
                (transition, true, message)
            }
            Err(err) => {
                let message = format!("Task {} failed: {}", task.name, err);
                (task.fail(&err.to_string(), now), false, message)
            }
        };
        if let Err(err) = transition {
            error!(task_id = %task_id, error = %err, "dropping runner result");
            return;
        }
        let snapshot = task.clone();

        let counted = if succeeded {
            state.orchestration.record_completed()
        } else {
            state.orchestration.record_failed()
        };
        if let Err(err) = counted {
            error!(orchestration_id = %orchestration_id, error = %err, "task counters out of range");
        }

        if succeeded {
            info!(
                orchestration_id = %orchestration_id,
                task_id = %task_id,
                duration_ms = snapshot.duration_ms.unwrap_or(0),
                tokens = snapshot.tokens_used.unwrap_or(0),
                "task completed"
            );
        } else {
            warn!(
                orchestration_id = %orchestration_id,
                task_id = %task_id,
                attempts,
                error = snapshot.error_message.as_deref().unwrap_or(""),
                "task failed"
            );
        }
        self.events.publish(EventKind::TaskUpdate {
            task: snapshot.clone(),
            message,
        });

        if !succeeded {
            return;
        }

        let siblings = state.dag.all_tasks();
        let found = self.detector.detect(orchestration_id, &snapshot, &siblings);
        for conflict in found {
            let names: Vec<&str> = conflict
                .conflicting_tasks
                .iter()
                .filter_map(|id| state.dag.get_task(id).map(|t| t.name.as_str()))
                .collect();
            let message = format!(
                "{} conflict on {} between {}",
                conflict.conflict_type,
                conflict.file_path,
                names.join(" and ")
            );
            self.events.publish(EventKind::ConflictDetected {
                conflict: conflict.clone(),
                message,
            });
            state.conflicts.push(conflict);
        }
    }

    async fn handle_cancel(&mut self) -> Orchestration {
        let mut state = self.state.write().await;
        if state.orchestration.cancel(Utc::now()) {
            self.cancel.cancel();
            warn!(
                orchestration_id = %state.orchestration.id,
                running = state.dag.running_count(),
                "orchestration cancelled"
            );
            self.events.publish(EventKind::OrchestrationStatus {
                orchestration: state.orchestration.clone(),
                message: "Orchestration cancelled".to_string(),
            });
        }
        state.orchestration.clone()
    }

    /// Settle the terminal status, persist, and close the stream.
    async fn finalize(&mut self) {
        let record = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.orchestration.finalize(Utc::now());

            let orchestration = &state.orchestration;
            let blocked = state.dag.blocked_tasks().len();
            let message = if orchestration.cancelled {
                format!(
                    "Orchestration cancelled: {} completed, {} failed",
                    orchestration.completed_tasks, orchestration.failed_tasks
                )
            } else if orchestration.status == OrchestrationStatus::Completed {
                format!(
                    "Orchestration completed: {}/{} tasks succeeded",
                    orchestration.completed_tasks, orchestration.total_tasks
                )
            } else {
                format!(
                    "Orchestration failed: {} of {} tasks failed, {} blocked",
                    orchestration.failed_tasks, orchestration.total_tasks, blocked
                )
            };

            info!(
                orchestration_id = %orchestration.id,
                status = %orchestration.status,
                cancelled = orchestration.cancelled,
                completed = orchestration.completed_tasks,
                failed = orchestration.failed_tasks,
                blocked,
                duration_ms = orchestration.total_duration_ms.unwrap_or(0),
                subscribers = self.events.subscriber_count(),
                "orchestration finished"
            );
            self.events.publish(EventKind::OrchestrationStatus {
                orchestration: orchestration.clone(),
                message,
            });
            state.to_record()
        };

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&record).await {
                error!(orchestration_id = %record.orchestration.id, error = %err, "failed to persist orchestration");
            }
        }

        self.events.close();
        self.cancel.cancel();
        let _ = self.finished.send(true);
    }
}

/// Run one task on its own tokio task and report back through the intake.
fn spawn_runner(
    runner: Arc<dyn TaskRunner>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    intake: mpsc::UnboundedSender<Command>,
    task: SubagentTask,
) {
    tokio::spawn(async move {
        let task_id = task.id;
        let work = tokio::spawn(async move { retry.run(&runner, &task, &cancel).await });
        let (outcome, attempts) = match work.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(task_id = %task_id, error = %join_err, "runner task aborted");
                (
                    Err(RunnerError::Failed(format!("runner aborted: {}", join_err))),
                    1,
                )
            }
        };
        if intake
            .send(Command::TaskFinished {
                task_id,
                outcome,
                attempts,
            })
            .is_err()
        {
            debug!(task_id = %task_id, "coordinator gone, dropping runner result");
        }
    });
}

/// Apply a conflict action to `state` and publish the result.
fn apply_conflict_action(
    state: &mut OrchestrationState,
    events: &EventPublisher,
    conflict_id: &ConflictId,
    action: ConflictAction,
    at: DateTime<Utc>,
) -> Result<MergeConflict> {
    let involved: Vec<SubagentTask> = state
        .conflicts
        .iter()
        .find(|c| c.id == *conflict_id)
        .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?
        .conflicting_tasks
        .iter()
        .filter_map(|id| state.dag.get_task(id).cloned())
        .collect();
    let involved: Vec<&SubagentTask> = involved.iter().collect();

    let conflict = state.conflict_mut(conflict_id)?;
    let resolved = match action {
        ConflictAction::Resolve { auto } => {
            ConflictResolver::resolve(conflict, auto, &involved, at)? == ResolveOutcome::Resolved
        }
        ConflictAction::AcceptManual { content } => {
            ConflictResolver::accept_manual(conflict, content, at)?;
            true
        }
    };

    let snapshot = conflict.clone();
    if resolved {
        let strategy = snapshot
            .resolution
            .as_ref()
            .map(|r| r.strategy.to_string())
            .unwrap_or_default();
        info!(conflict_id = %snapshot.id, strategy = %strategy, "conflict resolved");
        events.publish(EventKind::ConflictResolved {
            message: format!("Conflict on {} resolved ({})", snapshot.file_path, strategy),
            conflict: snapshot.clone(),
        });
    }
    Ok(snapshot)
}

/// Cloneable access to one orchestration, live or finished.
#[derive(Clone)]
pub struct OrchestrationHandle {
    id: OrchestrationId,
    request_id: RequestId,
    state: Arc<RwLock<OrchestrationState>>,
    events: Arc<EventPublisher>,
    commands: mpsc::UnboundedSender<Command>,
    finished: watch::Receiver<bool>,
    store: Option<JsonStore>,
}

impl OrchestrationHandle {
    /// Wrap a finished orchestration loaded from storage.
    pub fn restored(state: OrchestrationState, store: Option<JsonStore>) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        let (_, finished) = watch::channel(true);
        let events = Arc::new(EventPublisher::new());
        events.close();
        Self {
            id: state.orchestration.id,
            request_id: state.orchestration.request_id.clone(),
            state: Arc::new(RwLock::new(state)),
            events,
            commands,
            finished,
            store,
        }
    }

    pub fn id(&self) -> OrchestrationId {
        self.id
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub async fn snapshot(&self) -> Orchestration {
        self.state.read().await.orchestration.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.orchestration.is_active()
    }

    pub async fn tasks(&self) -> Vec<SubagentTask> {
        self.state.read().await.tasks()
    }

    pub async fn task(&self, id: &TaskId) -> Result<SubagentTask> {
        self.state
            .read()
            .await
            .dag
            .get_task(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub async fn conflicts(&self) -> Vec<MergeConflict> {
        self.state.read().await.conflicts.clone()
    }

    pub async fn summary(&self) -> OrchestrationSummary {
        self.state.read().await.summary()
    }

    pub async fn results(&self) -> OrchestrationResults {
        self.state.read().await.results()
    }

    /// Attach to future events. Ends immediately if already finished.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Wait for the coordinator to finish and return the final snapshot.
    pub async fn wait(&self) -> Orchestration {
        let mut finished = self.finished.clone();
        // An error means the coordinator is gone; the state is final either way.
        let _ = finished.wait_for(|done| *done).await;
        self.snapshot().await
    }

    /// Cancel the orchestration. A finished orchestration is returned as is.
    pub async fn cancel(&self) -> Orchestration {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { reply }).is_ok() {
            if let Ok(snapshot) = rx.await {
                return snapshot;
            }
        }
        self.snapshot().await
    }

    pub async fn resolve_conflict(&self, conflict_id: ConflictId, auto: bool) -> Result<MergeConflict> {
        self.conflict_action(conflict_id, ConflictAction::Resolve { auto })
            .await
    }

    pub async fn accept_manual_resolution(
        &self,
        conflict_id: ConflictId,
        content: String,
    ) -> Result<MergeConflict> {
        self.conflict_action(conflict_id, ConflictAction::AcceptManual { content })
            .await
    }

    async fn conflict_action(&self, conflict_id: ConflictId, action: ConflictAction) -> Result<MergeConflict> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Conflict {
            conflict_id,
            action: action.clone(),
            reply,
        };
        if self.commands.send(command).is_ok() {
            if let Ok(result) = rx.await {
                return result;
            }
        }

        // Coordinator finished: nothing else mutates the state now.
        let (result, record) = {
            let mut state = self.state.write().await;
            let result = apply_conflict_action(&mut state, &self.events, &conflict_id, action, Utc::now());
            let record = (result.is_ok() && !state.orchestration.is_active()).then(|| state.to_record());
            (result, record)
        };
        if let (Some(store), Some(record)) = (&self.store, record) {
            if let Err(err) = store.save(&record).await {
                error!(orchestration_id = %self.id, error = %err, "failed to persist conflict resolution");
            }
        }
        result
    }
}
