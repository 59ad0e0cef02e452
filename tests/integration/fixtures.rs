//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted task runner with per-task outcomes, delays and gates
//! - Services wired to that runner
//! - Predefined plans
//! - Draining event streams

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fanout::core::{ApiContract, GeneratedFile, SubagentTask, TaskOutput, TaskStatus};
use fanout::orchestration::{
    EventReceiver, JsonStore, OrchestrationEvent, OrchestrationHandle, OrchestrationService,
    RetryPolicy, RunnerError, ServiceSettings, TaskPlan, TaskRunner, TaskSpec, TemplatePlanner,
};

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A one-shot latch. Tasks gated on it block until `open` is called.
#[derive(Clone, Default)]
pub struct Gate(CancellationToken);

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.0.cancel();
    }

    async fn wait(&self) {
        self.0.cancelled().await;
    }
}

/// What the runner does for one task key.
#[derive(Clone)]
pub struct Script {
    outcome: Result<TaskOutput, RunnerError>,
    delay: Duration,
    gate: Option<Gate>,
    honour_cancel: bool,
    unavailable_first: usize,
}

impl Script {
    pub fn files(files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(path, content)| GeneratedFile::new(path, content))
            .collect();
        Self::output(TaskOutput::with_files(files))
    }

    pub fn api(endpoint: &str, signature: &str) -> Self {
        Self::output(TaskOutput {
            api_contracts: vec![ApiContract {
                endpoint: endpoint.to_string(),
                signature: signature.to_string(),
            }],
            ..TaskOutput::default()
        })
    }

    pub fn output(output: TaskOutput) -> Self {
        Self {
            outcome: Ok(output),
            delay: Duration::ZERO,
            gate: None,
            honour_cancel: true,
            unavailable_first: 0,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            outcome: Err(RunnerError::Failed(message.to_string())),
            ..Self::output(TaskOutput::default())
        }
    }

    pub fn unavailable() -> Self {
        Self {
            outcome: Err(RunnerError::Unavailable("no subagent".to_string())),
            ..Self::output(TaskOutput::default())
        }
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    /// Keep running after cancellation and report the scripted outcome.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    /// Report `Unavailable` for the first `n` attempts.
    pub fn flaky(mut self, n: usize) -> Self {
        self.unavailable_first = n;
        self
    }
}

/// Runner driven by per-key scripts. Tasks without a script write one
/// file unique to their key.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, key: &str, script: Script) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }

    /// Keys in the order they were first started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_attempt(&self, key: &str) -> usize {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    async fn execute(
        &self,
        task: &SubagentTask,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, RunnerError> {
        let Some(script) = self.scripts.get(&task.key) else {
            return Ok(TaskOutput::with_files(vec![GeneratedFile::new(
                &format!("src/{}.rs", task.key),
                &format!("// {}\n", task.name),
            )]));
        };

        if self.next_attempt(&task.key) <= script.unavailable_first {
            return Err(RunnerError::Unavailable("subagent busy".to_string()));
        }

        if let Some(gate) = &script.gate {
            if script.honour_cancel {
                tokio::select! {
                    _ = gate.wait() => {}
                    _ = cancel.cancelled() => {
                        return Err(RunnerError::Failed("cancelled".to_string()));
                    }
                }
            } else {
                gate.wait().await;
            }
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        script.outcome.clone()
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(
        &self,
        task: &SubagentTask,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, RunnerError> {
        {
            let mut started = self.started.lock().unwrap();
            if !started.contains(&task.key) {
                started.push(task.key.clone());
            }
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.execute(task, &cancel).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn settings(max_concurrency: usize, store: Option<JsonStore>) -> ServiceSettings {
    ServiceSettings {
        max_concurrency,
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        store,
    }
}

pub fn service(runner: Arc<ScriptedRunner>, max_concurrency: usize) -> OrchestrationService {
    OrchestrationService::new(
        Arc::new(TemplatePlanner),
        runner,
        settings(max_concurrency, None),
    )
}

pub fn service_with_store(runner: Arc<ScriptedRunner>, store: JsonStore) -> OrchestrationService {
    OrchestrationService::new(Arc::new(TemplatePlanner), runner, settings(3, Some(store)))
}

/// frontend, backend, then tests over both.
pub fn web_plan() -> TaskPlan {
    TaskPlan::new(vec![
        TaskSpec::new("frontend", "Build frontend"),
        TaskSpec::new("backend", "Build backend"),
        TaskSpec::new("tests", "Write tests").depends_on(&["frontend", "backend"]),
    ])
}

/// `count` independent docs tasks keyed `t0..`.
pub fn independent_plan(count: usize) -> TaskPlan {
    TaskPlan::new(
        (0..count)
            .map(|i| TaskSpec::new("docs", &format!("Doc {}", i)).with_key(&format!("t{}", i)))
            .collect(),
    )
}

/// a -> b -> c
pub fn chain_plan() -> TaskPlan {
    TaskPlan::new(vec![
        TaskSpec::new("schema", "A").with_key("a"),
        TaskSpec::new("backend", "B").with_key("b").depends_on(&["a"]),
        TaskSpec::new("tests", "C").with_key("c").depends_on(&["b"]),
    ])
}

/// Read until the stream closes.
pub async fn drain(mut rx: EventReceiver) -> Vec<OrchestrationEvent> {
    tokio::time::timeout(TEST_TIMEOUT, async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("event stream did not close")
}

/// Poll until the task with `key` reaches `status`.
pub async fn wait_for_task(handle: &OrchestrationHandle, key: &str, status: TaskStatus) -> SubagentTask {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(task) = handle
                .tasks()
                .await
                .into_iter()
                .find(|t| t.key == key && t.status == status)
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task never reached the expected status")
}

pub fn task_by_key<'a>(tasks: &'a [SubagentTask], key: &str) -> &'a SubagentTask {
    tasks
        .iter()
        .find(|t| t.key == key)
        .expect("no task with that key")
}

pub fn event_types(events: &[OrchestrationEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}
