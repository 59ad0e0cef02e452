//! Request-facing orchestration API.
//!
//! `OrchestrationService` owns the registry of orchestrations started by
//! this process (plus those restored from disk) and is the only entry point
//! the HTTP layer and the CLI use. Orchestrations can be addressed by their
//! own id or by the request id that started them; a request id resolves to
//! its most recent orchestration.

use crate::config::{self, Config};
use crate::core::orchestration::OrchestrationSummary;
use crate::core::{
    ConflictId, MergeConflict, Orchestration, OrchestrationId, RequestId, SubagentTask, TaskId,
};
use crate::error::{Error, Result};
use crate::orchestration::builder::{DevRequest, GraphBuilder, TaskPlan, TaskPlanner, TemplatePlanner};
use crate::orchestration::events::EventReceiver;
use crate::orchestration::runner::{CommandRunner, RetryPolicy, TaskRunner};
use crate::orchestration::scheduler::{OrchestrationHandle, Scheduler};
use crate::orchestration::state::{OrchestrationResults, OrchestrationState};
use crate::orchestration::store::JsonStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Knobs the service applies to every orchestration it starts.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub store: Option<JsonStore>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            retry: RetryPolicy::default(),
            store: None,
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            retry: RetryPolicy::new(config.dispatch_retries, config.retry_backoff()),
            store: config.state_dir().map(JsonStore::new),
        }
    }
}

#[derive(Default)]
struct Registry {
    handles: HashMap<OrchestrationId, OrchestrationHandle>,
    /// Newest orchestration per request, by creation time.
    latest: HashMap<RequestId, (DateTime<Utc>, OrchestrationId)>,
}

impl Registry {
    fn insert(&mut self, handle: OrchestrationHandle, created_at: DateTime<Utc>) {
        let newer = self
            .latest
            .get(handle.request_id())
            .map_or(true, |(current, _)| created_at >= *current);
        if newer {
            self.latest
                .insert(handle.request_id().clone(), (created_at, handle.id()));
        }
        self.handles.insert(handle.id(), handle);
    }

    fn latest_for(&self, request_id: &RequestId) -> Option<&OrchestrationHandle> {
        self.latest
            .get(request_id)
            .and_then(|(_, id)| self.handles.get(id))
    }
}

#[derive(Clone)]
pub struct OrchestrationService {
    planner: Arc<dyn TaskPlanner>,
    runner: Arc<dyn TaskRunner>,
    settings: ServiceSettings,
    registry: Arc<RwLock<Registry>>,
}

impl OrchestrationService {
    pub fn new(
        planner: Arc<dyn TaskPlanner>,
        runner: Arc<dyn TaskRunner>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            planner,
            runner,
            settings,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Template planner plus the configured subagent command.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(TemplatePlanner),
            Arc::new(CommandRunner::new(&config.runner)),
            ServiceSettings::from_config(config),
        )
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Plan `request` and start executing it.
    ///
    /// # Errors
    /// `AlreadyRunning` while an earlier orchestration for the same request
    /// is still active; `GraphConstruction` if the plan is not a DAG.
    pub async fn start_orchestration(
        &self,
        request: DevRequest,
        max_concurrency: Option<usize>,
    ) -> Result<(OrchestrationHandle, EventReceiver)> {
        self.ensure_not_running(&request.request_id).await?;
        let plan = self.planner.plan(&request).await?;
        self.start_with_plan(request, plan, max_concurrency).await
    }

    /// Start executing a caller-supplied plan.
    pub async fn start_with_plan(
        &self,
        request: DevRequest,
        plan: TaskPlan,
        max_concurrency: Option<usize>,
    ) -> Result<(OrchestrationHandle, EventReceiver)> {
        if request.request_id.as_str().trim().is_empty() {
            return Err(Error::Validation("requestId must not be empty".into()));
        }
        let limit = max_concurrency.unwrap_or(self.settings.max_concurrency);
        config::validate_concurrency(limit)?;

        // Held across check and insert so two starts cannot both pass.
        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.latest_for(&request.request_id) {
            if existing.is_active().await {
                return Err(Error::AlreadyRunning {
                    request_id: request.request_id.to_string(),
                });
            }
        }

        let built = GraphBuilder::build(&request, &plan, limit)?;
        let created_at = built.orchestration.created_at;
        let (handle, events) = Scheduler::start(
            built,
            Arc::clone(&self.runner),
            self.settings.retry,
            self.settings.store.clone(),
        )?;
        registry.insert(handle.clone(), created_at);
        Ok((handle, events))
    }

    async fn ensure_not_running(&self, request_id: &RequestId) -> Result<()> {
        let registry = self.registry.read().await;
        if let Some(existing) = registry.latest_for(request_id) {
            if existing.is_active().await {
                return Err(Error::AlreadyRunning {
                    request_id: request_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Look up by orchestration id, falling back to request id.
    pub async fn handle(&self, id: &str) -> Result<OrchestrationHandle> {
        let registry = self.registry.read().await;
        let by_id = id
            .parse::<OrchestrationId>()
            .ok()
            .and_then(|oid| registry.handles.get(&oid));
        by_id
            .or_else(|| registry.latest_for(&RequestId::from(id)))
            .cloned()
            .ok_or_else(|| Error::OrchestrationNotFound(id.to_string()))
    }

    /// Every known orchestration, oldest first.
    pub async fn list(&self) -> Vec<Orchestration> {
        let handles: Vec<OrchestrationHandle> =
            self.registry.read().await.handles.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.snapshot().await);
        }
        snapshots.sort_by_key(|o| o.created_at);
        snapshots
    }

    pub async fn get_status(&self, id: &str) -> Result<Orchestration> {
        Ok(self.handle(id).await?.snapshot().await)
    }

    pub async fn get_tasks(&self, id: &str) -> Result<Vec<SubagentTask>> {
        Ok(self.handle(id).await?.tasks().await)
    }

    pub async fn get_task(&self, id: &str, task_id: &str) -> Result<SubagentTask> {
        let task_id: TaskId = task_id
            .parse()
            .map_err(|_| Error::TaskNotFound(task_id.to_string()))?;
        self.handle(id).await?.task(&task_id).await
    }

    pub async fn get_conflicts(&self, id: &str) -> Result<Vec<MergeConflict>> {
        Ok(self.handle(id).await?.conflicts().await)
    }

    pub async fn resolve_conflict(&self, id: &str, conflict_id: &str, auto: bool) -> Result<MergeConflict> {
        let conflict_id = parse_conflict_id(conflict_id)?;
        self.handle(id).await?.resolve_conflict(conflict_id, auto).await
    }

    pub async fn accept_manual_resolution(
        &self,
        id: &str,
        conflict_id: &str,
        content: String,
    ) -> Result<MergeConflict> {
        let conflict_id = parse_conflict_id(conflict_id)?;
        self.handle(id)
            .await?
            .accept_manual_resolution(conflict_id, content)
            .await
    }

    pub async fn cancel_orchestration(&self, id: &str) -> Result<Orchestration> {
        Ok(self.handle(id).await?.cancel().await)
    }

    pub async fn subscribe(&self, id: &str) -> Result<EventReceiver> {
        Ok(self.handle(id).await?.subscribe())
    }

    pub async fn get_results(&self, id: &str) -> Result<OrchestrationResults> {
        Ok(self.handle(id).await?.results().await)
    }

    pub async fn get_summary(&self, id: &str) -> Result<OrchestrationSummary> {
        Ok(self.handle(id).await?.summary().await)
    }

    /// Wait for an orchestration to finish.
    ///
    /// # Errors
    /// `Timeout` if it is still running after `timeout`.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Orchestration> {
        let handle = self.handle(id).await?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, handle.wait())
                .await
                .map_err(|_| Error::Timeout(limit)),
            None => Ok(handle.wait().await),
        }
    }

    /// Load persisted orchestrations into the registry.
    ///
    /// Records that were still active are settled as `interrupted` and
    /// written back. Returns how many records were loaded.
    pub async fn restore(&self) -> Result<usize> {
        let Some(store) = self.settings.store.clone() else {
            return Ok(0);
        };

        let records = store.load_all().await?;
        let mut restored = 0;
        for record in records {
            let id = record.orchestration.id;
            let mut state = match OrchestrationState::from_record(record) {
                Ok(state) => state,
                Err(err) => {
                    warn!(orchestration_id = %id, error = %err, "skipping corrupt record");
                    continue;
                }
            };
            if state.interrupt(Utc::now()) {
                warn!(orchestration_id = %id, "orchestration was interrupted");
                if let Err(err) = store.save(&state.to_record()).await {
                    warn!(orchestration_id = %id, error = %err, "failed to persist interrupted orchestration");
                }
            }

            let created_at = state.orchestration.created_at;
            let handle = OrchestrationHandle::restored(state, Some(store.clone()));
            let mut registry = self.registry.write().await;
            // A live orchestration always wins over a record from disk.
            if !registry.handles.contains_key(&id) {
                registry.insert(handle, created_at);
                restored += 1;
            }
        }

        info!(count = restored, dir = %store.dir().display(), "restored orchestrations");
        Ok(restored)
    }
}

fn parse_conflict_id(raw: &str) -> Result<ConflictId> {
    raw.parse()
        .map_err(|_| Error::ConflictNotFound(raw.to_string()))
}
