//! Parallel subagent orchestration.
//!
//! A request is decomposed into a task DAG ([`builder`]), executed by a
//! per-orchestration coordinator under a concurrency limit ([`scheduler`]),
//! checked for conflicting outputs as tasks complete ([`detector`],
//! [`resolver`]) and observed through an ordered event stream ([`events`]).
//! [`service`] ties these together behind one API.

pub mod builder;
pub mod detector;
pub mod events;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;

pub use builder::{DevRequest, GraphBuilder, TaskPlan, TaskPlanner, TaskSpec, TemplatePlanner};
pub use detector::ConflictDetector;
pub use events::{EventKind, EventPublisher, EventReceiver, OrchestrationEvent};
pub use resolver::{ConflictResolver, ResolveOutcome};
pub use runner::{CommandRunner, RetryPolicy, RunnerError, TaskRunner};
pub use scheduler::{OrchestrationHandle, Scheduler};
pub use service::{OrchestrationService, ServiceSettings};
pub use state::{OrchestrationRecord, OrchestrationResults, OrchestrationState};
pub use store::JsonStore;
