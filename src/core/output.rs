//! Structured task output and the resource view used for conflict detection.
//!
//! Runners return either a JSON document matching [`TaskOutput`] or free
//! text. Free text is scanned for generated files written as a `### path`
//! heading followed by a fenced code block.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Output schema version written by this build.
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// `### path/to/file.ext` followed by a fenced block.
static GENERATED_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^###\s+(?P<path>\S+)\s*\n```(?P<lang>[\w+#.-]*)[^\n]*\n(?P<body>[\s\S]*?)\n?```")
        .expect("generated file pattern is valid")
});

/// A file produced by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl GeneratedFile {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
            language: None,
        }
    }
}

/// An API surface declared by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiContract {
    /// e.g. `GET /users/{id}`
    pub endpoint: String,
    /// Request/response shape as the task wrote it.
    pub signature: String,
}

/// Runner output for a completed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub api_contracts: Vec<ApiContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

fn default_schema_version() -> u32 {
    OUTPUT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    ApiContract,
}

/// One shared resource a task output touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub resource_key: String,
    pub kind: ResourceKind,
    pub content_hash: String,
}

impl TaskOutput {
    pub fn with_files(files: Vec<GeneratedFile>) -> Self {
        Self {
            schema_version: OUTPUT_SCHEMA_VERSION,
            files,
            ..Self::default()
        }
    }

    /// Parse runner stdout: a JSON `TaskOutput` first, then the markdown
    /// convention. Non-JSON text is always kept as `raw_output`.
    pub fn parse(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.starts_with('{') {
            if let Ok(mut output) = serde_json::from_str::<TaskOutput>(trimmed) {
                if output.schema_version == 0 {
                    output.schema_version = OUTPUT_SCHEMA_VERSION;
                }
                return output;
            }
        }

        Self {
            schema_version: OUTPUT_SCHEMA_VERSION,
            files: parse_generated_files(stdout),
            api_contracts: Vec::new(),
            raw_output: Some(stdout.to_string()),
            tokens_used: 0,
        }
    }

    /// The shared resources this output touches, one per file path and one
    /// per API endpoint. A later entry for the same key wins.
    pub fn resources(&self) -> Vec<ResourceView> {
        let mut views: Vec<ResourceView> = Vec::new();

        let mut push = |key: &str, kind: ResourceKind, body: &str| {
            let view = ResourceView {
                resource_key: key.to_string(),
                kind,
                content_hash: content_hash(body),
            };
            match views
                .iter_mut()
                .find(|v| v.kind == kind && v.resource_key == key)
            {
                Some(existing) => *existing = view,
                None => views.push(view),
            }
        };

        for file in &self.files {
            push(&normalize_path(&file.path), ResourceKind::File, &file.content);
        }
        for contract in &self.api_contracts {
            push(
                &format!("api:{}", normalize_endpoint(&contract.endpoint)),
                ResourceKind::ApiContract,
                &contract.signature,
            );
        }
        views
    }

    pub fn file(&self, path: &str) -> Option<&GeneratedFile> {
        let wanted = normalize_path(path);
        self.files
            .iter()
            .rev()
            .find(|f| normalize_path(&f.path) == wanted)
    }

    pub fn api_contract(&self, endpoint: &str) -> Option<&ApiContract> {
        let wanted = normalize_endpoint(endpoint);
        self.api_contracts
            .iter()
            .rev()
            .find(|c| normalize_endpoint(&c.endpoint) == wanted)
    }
}

/// Extract `### path` + fenced block pairs from markdown output.
pub fn parse_generated_files(text: &str) -> Vec<GeneratedFile> {
    GENERATED_FILE
        .captures_iter(text)
        .map(|caps| {
            let lang = caps.name("lang").map(|m| m.as_str()).unwrap_or_default();
            GeneratedFile {
                path: caps["path"].to_string(),
                content: caps["body"].to_string(),
                language: (!lang.is_empty()).then(|| lang.to_string()),
            }
        })
        .collect()
}

/// Hex SHA-256 of content with line endings normalized and trailing
/// whitespace trimmed.
pub fn content_hash(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let digest = Sha256::digest(normalized.trim_end().as_bytes());
    format!("{:x}", digest)
}

pub fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").replace('\\', "/")
}

/// Method upper-cased, single spaces, trailing slash dropped.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let mut parts = endpoint.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => {
            let path = path.trim_end_matches('/');
            format!(
                "{} {}",
                method.to_ascii_uppercase(),
                if path.is_empty() { "/" } else { path }
            )
        }
        (Some(only), None) => only.trim_end_matches('/').to_string(),
        _ => String::new(),
    }
}
