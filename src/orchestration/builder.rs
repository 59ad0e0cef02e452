//! Task graph construction.
//!
//! A development request becomes a [`TaskPlan`] (from a [`TaskPlanner`] or
//! supplied by the caller), and [`GraphBuilder`] turns the plan into task
//! records plus a validated dependency DAG. This is the only place
//! dependency edges are created.

use crate::core::{Orchestration, OrchestrationId, RequestId, SubagentTask, TaskDAG, TaskType};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// The development request an orchestration is built for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevRequest {
    pub request_id: RequestId,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl DevRequest {
    pub fn new(request_id: impl Into<RequestId>, description: &str) -> Self {
        Self {
            request_id: request_id.into(),
            description: description.to_string(),
            framework: None,
            category: None,
        }
    }
}

/// One planned task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Unique within the plan. Defaults to the task type.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(alias = "type")]
    pub task_type: TaskType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: serde_json::Value,
    /// Keys of other specs, or task types matched case-insensitively.
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
}

impl TaskSpec {
    pub fn new(task_type: &str, name: &str) -> Self {
        Self {
            key: None,
            task_type: TaskType::from(task_type),
            name: name.to_string(),
            description: String::new(),
            context: serde_json::Value::Null,
            depends_on: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn effective_key(&self) -> String {
        self.key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| self.task_type.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<TaskSpec>,
}

impl TaskPlan {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Read a plan from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&text)?),
            _ => Ok(serde_json::from_str(&text)?),
        }
    }
}

/// Turns a request into a plan.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    async fn plan(&self, request: &DevRequest) -> Result<TaskPlan>;
}

/// Deterministic default decomposition: frontend and backend in parallel,
/// then tests over both.
#[derive(Debug, Clone, Default)]
pub struct TemplatePlanner;

impl TemplatePlanner {
    pub fn default_plan(request: &DevRequest) -> TaskPlan {
        let subject = if request.description.trim().is_empty() {
            format!("request {}", request.request_id)
        } else {
            request.description.trim().to_string()
        };

        TaskPlan::new(vec![
            TaskSpec::new("frontend", "Build frontend")
                .with_description(&format!("UI components, pages and API client for {}", subject)),
            TaskSpec::new("backend", "Build backend")
                .with_description(&format!("API endpoints, services and data access for {}", subject)),
            TaskSpec::new("tests", "Write tests")
                .with_description(&format!("Unit and integration tests for {}", subject))
                .depends_on(&["frontend", "backend"]),
        ])
    }
}

#[async_trait]
impl TaskPlanner for TemplatePlanner {
    async fn plan(&self, request: &DevRequest) -> Result<TaskPlan> {
        Ok(Self::default_plan(request))
    }
}

/// Orchestration record plus its task graph, ready for the coordinator.
#[derive(Debug)]
pub struct BuiltGraph {
    pub orchestration: Orchestration,
    pub dag: TaskDAG,
}

pub struct GraphBuilder;

impl GraphBuilder {
    /// Build task records and the dependency DAG for `plan`.
    ///
    /// # Errors
    /// `GraphConstruction` for an empty plan, duplicate keys, unknown or
    /// self-referencing dependencies, and cycles.
    pub fn build(request: &DevRequest, plan: &TaskPlan, max_concurrency: usize) -> Result<BuiltGraph> {
        if plan.tasks.is_empty() {
            return Err(Error::GraphConstruction("plan has no tasks".into()));
        }

        let orchestration_id = OrchestrationId::new();
        let keys: Vec<String> = plan.tasks.iter().map(TaskSpec::effective_key).collect();

        let mut by_key: HashMap<&str, usize> = HashMap::new();
        for (index, key) in keys.iter().enumerate() {
            if by_key.insert(key.as_str(), index).is_some() {
                return Err(Error::GraphConstruction(format!(
                    "duplicate task key '{}'",
                    key
                )));
            }
        }

        let mut dag = TaskDAG::new();
        let mut ids = Vec::with_capacity(plan.tasks.len());
        for (sequence, (spec, key)) in plan.tasks.iter().zip(&keys).enumerate() {
            let task = SubagentTask::new(
                orchestration_id,
                request.request_id.clone(),
                sequence,
                key,
                spec.task_type.clone(),
                &spec.name,
                &spec.description,
            )
            .with_context(task_context(request, spec));
            ids.push(task.id);
            dag.add_task(task);
        }

        for (index, spec) in plan.tasks.iter().enumerate() {
            for reference in &spec.depends_on {
                let targets = resolve_reference(plan, &by_key, reference);
                if targets.is_empty() {
                    return Err(Error::GraphConstruction(format!(
                        "task '{}' depends on unknown task '{}'",
                        keys[index], reference
                    )));
                }
                for target in targets {
                    if target == index {
                        return Err(Error::GraphConstruction(format!(
                            "task '{}' depends on itself",
                            keys[index]
                        )));
                    }
                    dag.add_dependency(&ids[target], &ids[index])?;
                }
            }
        }

        // Acyclic graphs always have a topological order, so every task is
        // reachable from a root.
        dag.topological_order()?;

        let orchestration = Orchestration::new(
            orchestration_id,
            request.request_id.clone(),
            dag.adjacency(),
            max_concurrency,
        );
        debug!(
            orchestration_id = %orchestration.id,
            request_id = %request.request_id,
            tasks = dag.task_count(),
            edges = dag.dependency_count(),
            "task graph built"
        );
        Ok(BuiltGraph { orchestration, dag })
    }
}

/// Key match first, then every spec whose task type matches case-insensitively.
fn resolve_reference(plan: &TaskPlan, by_key: &HashMap<&str, usize>, reference: &str) -> Vec<usize> {
    if let Some(&index) = by_key.get(reference) {
        return vec![index];
    }
    plan.tasks
        .iter()
        .enumerate()
        .filter(|(_, spec)| {
            TaskType::from(reference) == spec.task_type
                || spec.task_type.as_str().eq_ignore_ascii_case(reference)
        })
        .map(|(index, _)| index)
        .collect()
}

fn task_context(request: &DevRequest, spec: &TaskSpec) -> serde_json::Value {
    json!({
        "request": {
            "description": request.description,
            "framework": request.framework,
            "category": request.category,
        },
        "task": spec.context,
    })
}
