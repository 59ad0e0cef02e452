//! Merge conflicts raised between completed task outputs.

use crate::core::orchestration::OrchestrationId;
use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

uuid_id!(
    /// Unique identifier for a merge conflict.
    ConflictId
);

/// Conflict category.
///
/// Only the detector and the resolver strategy table look at this; new
/// categories arrive as `Other` without touching the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConflictType {
    Import,
    ApiContract,
    SharedFile,
    Other(String),
}

impl ConflictType {
    pub fn as_str(&self) -> &str {
        match self {
            ConflictType::Import => "import",
            ConflictType::ApiContract => "api_contract",
            ConflictType::SharedFile => "shared_file",
            ConflictType::Other(s) => s,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ConflictType::ApiContract => Severity::High,
            ConflictType::Import | ConflictType::SharedFile => Severity::Medium,
            ConflictType::Other(_) => Severity::Low,
        }
    }
}

impl From<String> for ConflictType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "import" => ConflictType::Import,
            "api_contract" => ConflictType::ApiContract,
            "shared_file" => ConflictType::SharedFile,
            _ => ConflictType::Other(value),
        }
    }
}

impl From<ConflictType> for String {
    fn from(value: ConflictType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    #[default]
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    PreferLatest,
    MergeNonOverlapping,
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::PreferLatest => write!(f, "prefer_latest"),
            ResolutionStrategy::MergeNonOverlapping => write!(f, "merge_non_overlapping"),
            ResolutionStrategy::Manual => write!(f, "manual"),
        }
    }
}

/// How a conflict was settled. Task records are never touched; the merged
/// content lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
    pub note: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub id: ConflictId,
    pub orchestration_id: OrchestrationId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// File path or resource key of the contended artifact.
    pub file_path: String,
    pub description: String,
    /// Task ids in creation order; always at least two.
    pub conflicting_tasks: Vec<TaskId>,
    pub status: ConflictStatus,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Set when a manual resolution was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_requested_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

impl MergeConflict {
    pub fn new(
        orchestration_id: OrchestrationId,
        conflict_type: ConflictType,
        file_path: &str,
        description: String,
        conflicting_tasks: Vec<TaskId>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            orchestration_id,
            severity: conflict_type.severity(),
            conflict_type,
            file_path: file_path.to_string(),
            description,
            conflicting_tasks,
            status: ConflictStatus::Unresolved,
            resolution: None,
            manual_requested_at: None,
            detected_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    pub fn awaiting_manual(&self) -> bool {
        !self.is_resolved() && self.manual_requested_at.is_some()
    }
}
