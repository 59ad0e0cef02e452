//! Conflict detection between completed task outputs.
//!
//! Detection compares the resource view of a newly completed task against
//! every completed sibling. Two tasks writing the same file path collide;
//! two tasks declaring the same API endpoint collide when the signatures
//! differ. Each (type, resource, task pair) is reported once.

use crate::core::output::ResourceKind;
use crate::core::{ConflictType, MergeConflict, OrchestrationId, SubagentTask, TaskId};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// Lines that shape a module's import/export surface.
static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(import\b|use\b|pub use\b|#include\b|using\b|from\s+\S+\s+import\b|export\s+(\*|\{[^}]*\})\s+from\b|(const|let|var)\s+\S+\s*=\s*require\()",
    )
    .expect("import line pattern is valid")
});

/// File names that exist to be imported from.
static MODULE_SURFACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|/)(types(/|\.[\w.]+$)|index\.\w+$|mod\.rs$|lib\.rs$|__init__\.py$|[^/]+\.d\.ts$)")
        .expect("module surface pattern is valid")
});

type SeenKey = (String, String, TaskId, TaskId);

/// Stateful detector for one orchestration.
#[derive(Debug, Default)]
pub struct ConflictDetector {
    seen: HashSet<SeenKey>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `completed` against every other completed sibling and return
    /// conflicts not reported before.
    pub fn detect(
        &mut self,
        orchestration_id: OrchestrationId,
        completed: &SubagentTask,
        siblings: &[&SubagentTask],
    ) -> Vec<MergeConflict> {
        let Some(output) = completed.output.as_ref().filter(|_| completed.is_completed()) else {
            return Vec::new();
        };
        let ours = output.resources();
        if ours.is_empty() {
            return Vec::new();
        }

        let mut found = Vec::new();
        for sibling in siblings {
            if sibling.id == completed.id || !sibling.is_completed() {
                continue;
            }
            let Some(their_output) = sibling.output.as_ref() else {
                continue;
            };
            let theirs = their_output.resources();

            // Creation order keeps the pair stable regardless of which side
            // finished last.
            let (first, second) = if completed.sequence <= sibling.sequence {
                (completed, *sibling)
            } else {
                (*sibling, completed)
            };

            for view in &ours {
                let Some(other) = theirs
                    .iter()
                    .find(|t| t.kind == view.kind && t.resource_key == view.resource_key)
                else {
                    continue;
                };

                let same_content = view.content_hash == other.content_hash;
                let (conflict_type, description) = match view.kind {
                    ResourceKind::ApiContract => {
                        if same_content {
                            continue;
                        }
                        (
                            ConflictType::ApiContract,
                            format!(
                                "{} and {} declare {} with different signatures",
                                first.name,
                                second.name,
                                view.resource_key.trim_start_matches("api:")
                            ),
                        )
                    }
                    ResourceKind::File => {
                        let conflict_type = classify_file(&view.resource_key, first, second);
                        let detail = if same_content {
                            "identical content"
                        } else {
                            "different content"
                        };
                        (
                            conflict_type,
                            format!(
                                "{} and {} both wrote {} ({})",
                                first.name, second.name, view.resource_key, detail
                            ),
                        )
                    }
                };

                let key = (
                    conflict_type.to_string(),
                    view.resource_key.clone(),
                    first.id,
                    second.id,
                );
                if !self.seen.insert(key) {
                    continue;
                }

                debug!(
                    orchestration_id = %orchestration_id,
                    conflict_type = %conflict_type,
                    resource = %view.resource_key,
                    "conflict detected"
                );
                found.push(MergeConflict::new(
                    orchestration_id,
                    conflict_type,
                    &view.resource_key,
                    description,
                    vec![first.id, second.id],
                ));
            }
        }
        found
    }
}

/// `import` for module-surface files or when the import/export lines of the
/// two versions differ, `shared_file` otherwise.
fn classify_file(path: &str, a: &SubagentTask, b: &SubagentTask) -> ConflictType {
    if MODULE_SURFACE.is_match(path) {
        return ConflictType::Import;
    }
    let imports = |task: &SubagentTask| -> Vec<String> {
        task.output
            .as_ref()
            .and_then(|o| o.file(path))
            .map(|f| import_lines(&f.content))
            .unwrap_or_default()
    };
    if imports(a) != imports(b) {
        ConflictType::Import
    } else {
        ConflictType::SharedFile
    }
}

pub fn is_import_line(line: &str) -> bool {
    IMPORT_LINE.is_match(line)
}

pub fn import_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| is_import_line(line))
        .map(|line| line.trim().to_string())
        .collect()
}
