//! Core domain models for subagent orchestration.
//!
//! This module contains the records the coordinator owns: the orchestration
//! itself, its subagent tasks, the dependency DAG over them, the merge
//! conflicts raised between task outputs, and the structured view of a
//! task's output that conflict detection reads.

/// Declare a UUID-backed identifier newtype with the usual conversions.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            /// Create a new unique identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return first 8 characters of the UUID for display.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

pub mod conflict;
pub mod dag;
pub mod orchestration;
pub mod output;
pub mod task;

pub use conflict::{
    ConflictId, ConflictStatus, ConflictType, MergeConflict, Resolution, ResolutionStrategy,
    Severity,
};
pub use dag::TaskDAG;
pub use orchestration::{Orchestration, OrchestrationId, OrchestrationStatus, RequestId};
pub use output::{ApiContract, GeneratedFile, ResourceKind, ResourceView, TaskOutput};
pub use task::{SubagentTask, TaskId, TaskStatus, TaskType};
