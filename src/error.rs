use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Graph construction failed: {0}")]
    GraphConstruction(String),

    #[error("Orchestration already running for request {request_id}")]
    AlreadyRunning { request_id: String },

    #[error("Orchestration not found: {0}")]
    OrchestrationNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::GraphConstruction(_) => "graph_construction",
            Error::AlreadyRunning { .. } => "already_running",
            Error::OrchestrationNotFound(_) => "orchestration_not_found",
            Error::TaskNotFound(_) => "task_not_found",
            Error::ConflictNotFound(_) => "conflict_not_found",
            Error::AlreadyResolved(_) => "already_resolved",
            Error::Validation(_) => "invalid_argument",
            Error::Timeout(_) => "timeout",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
