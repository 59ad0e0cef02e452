//! Conflict resolution.
//!
//! Auto-resolution picks a strategy from the conflict type and records the
//! outcome on the conflict itself; task records are never touched. Manual
//! resolution is a hand-off: the request is recorded, and the conflict is
//! only marked resolved once the caller's content is accepted.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::detector::{import_lines, is_import_line};
use crate::core::{
    ConflictStatus, ConflictType, MergeConflict, Resolution, ResolutionStrategy, SubagentTask,
};
use crate::error::{Error, Result};

/// Result of a line-level merge of two file versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Both versions fit together.
    Merged {
        /// The combined content.
        content: String,
    },
    /// The versions disagree on at least one line position.
    Overlapping {
        /// First line index where they differ.
        line: usize,
    },
}

impl MergeResult {
    pub fn merged(content: impl Into<String>) -> Self {
        Self::Merged {
            content: content.into(),
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Merged { content } => Some(content),
            Self::Overlapping { .. } => None,
        }
    }
}

/// Outcome of a `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// A strategy was applied and the conflict is now resolved.
    Resolved,
    /// Manual resolution was requested for the first time.
    ManualRequested,
    /// Manual resolution had already been requested.
    ManualPending,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Apply `auto` or record a manual hand-off.
    ///
    /// `tasks` are the completed tasks named in `conflicting_tasks`.
    ///
    /// # Errors
    /// `AlreadyResolved` if the conflict was resolved before. Nothing is
    /// applied twice.
    pub fn resolve(
        conflict: &mut MergeConflict,
        auto: bool,
        tasks: &[&SubagentTask],
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome> {
        if conflict.is_resolved() {
            return Err(Error::AlreadyResolved(conflict.id.to_string()));
        }

        if !auto {
            if conflict.manual_requested_at.is_some() {
                return Ok(ResolveOutcome::ManualPending);
            }
            conflict.manual_requested_at = Some(at);
            debug!(conflict_id = %conflict.id, "manual resolution requested");
            return Ok(ResolveOutcome::ManualRequested);
        }

        let resolution = Self::auto_resolution(conflict, tasks, at);
        debug!(
            conflict_id = %conflict.id,
            strategy = %resolution.strategy,
            "conflict auto-resolved"
        );
        conflict.resolution = Some(resolution);
        conflict.status = ConflictStatus::Resolved;
        Ok(ResolveOutcome::Resolved)
    }

    /// Accept caller-supplied content for a conflict.
    pub fn accept_manual(
        conflict: &mut MergeConflict,
        content: String,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if conflict.is_resolved() {
            return Err(Error::AlreadyResolved(conflict.id.to_string()));
        }
        conflict.manual_requested_at.get_or_insert(at);
        conflict.resolution = Some(Resolution {
            strategy: ResolutionStrategy::Manual,
            winner: None,
            merged_content: Some(content),
            note: "resolution supplied by reviewer".to_string(),
            resolved_at: at,
        });
        conflict.status = ConflictStatus::Resolved;
        Ok(())
    }

    fn auto_resolution(
        conflict: &MergeConflict,
        tasks: &[&SubagentTask],
        at: DateTime<Utc>,
    ) -> Resolution {
        let versions: Vec<(&SubagentTask, Option<String>)> = conflict
            .conflicting_tasks
            .iter()
            .filter_map(|id| tasks.iter().find(|t| t.id == *id).copied())
            .map(|task| (task, contested_content(conflict, task)))
            .collect();

        let merge = match (&conflict.conflict_type, versions.as_slice()) {
            (ConflictType::Import, [(_, Some(a)), (_, Some(b)), ..]) => {
                Some(merge_imports(a, b))
            }
            (ConflictType::SharedFile, [(_, Some(a)), (_, Some(b)), ..]) => {
                match merge_positional(a, b) {
                    MergeResult::Merged { content } => Some(content),
                    MergeResult::Overlapping { .. } => None,
                }
            }
            _ => None,
        };

        if let Some(content) = merge {
            return Resolution {
                strategy: ResolutionStrategy::MergeNonOverlapping,
                winner: None,
                merged_content: Some(content),
                note: format!("merged {} versions of {}", versions.len(), conflict.file_path),
                resolved_at: at,
            };
        }

        // Latest completion wins; creation order breaks ties.
        let winner = versions
            .iter()
            .max_by_key(|(task, _)| (task.completed_at, task.sequence))
            .map(|(task, content)| (task, content.clone()));

        match winner {
            Some((task, content)) => Resolution {
                strategy: ResolutionStrategy::PreferLatest,
                winner: Some(task.id),
                merged_content: content,
                note: format!("kept {} from {}, the latest to complete", conflict.file_path, task.name),
                resolved_at: at,
            },
            None => Resolution {
                strategy: ResolutionStrategy::PreferLatest,
                winner: conflict.conflicting_tasks.last().copied(),
                merged_content: None,
                note: "task outputs unavailable, kept the last conflicting task".to_string(),
                resolved_at: at,
            },
        }
    }
}

/// What `task` produced for the conflict's resource.
fn contested_content(conflict: &MergeConflict, task: &SubagentTask) -> Option<String> {
    let output = task.output.as_ref()?;
    match conflict.file_path.strip_prefix("api:") {
        Some(endpoint) => output.api_contract(endpoint).map(|c| c.signature.clone()),
        None => output.file(&conflict.file_path).map(|f| f.content.clone()),
    }
}

/// Union of import lines (first-seen order), then the first body followed
/// by the second body as one block. The second block is dropped only when
/// the first body already contains it verbatim.
pub fn merge_imports(a: &str, b: &str) -> String {
    let mut imports: Vec<String> = import_lines(a);
    for line in import_lines(b) {
        if !imports.contains(&line) {
            imports.push(line);
        }
    }

    let body = |text: &str| -> String {
        text.lines()
            .filter(|l| !is_import_line(l))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    };
    let first = body(a);
    let second = body(b);

    let mut blocks: Vec<&str> = Vec::new();
    if !first.is_empty() {
        blocks.push(&first);
    }
    if !second.is_empty() && !first.contains(second.as_str()) {
        blocks.push(&second);
    }

    let mut out = imports.join("\n");
    if !blocks.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&blocks.join("\n\n"));
    }
    out
}

/// Merge two versions that only differ by one extending the other.
pub fn merge_positional(a: &str, b: &str) -> MergeResult {
    let left: Vec<&str> = a.lines().collect();
    let right: Vec<&str> = b.lines().collect();
    if let Some(line) = left.iter().zip(&right).position(|(l, r)| l != r) {
        return MergeResult::Overlapping { line };
    }
    if left.len() >= right.len() {
        MergeResult::merged(a)
    } else {
        MergeResult::merged(b)
    }
}
