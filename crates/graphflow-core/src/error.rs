use thiserror::Error;

/// Reasons a graph description or execute request is rejected before any
/// state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("graph has no tasks")]
    NoTasks,

    #[error("graph has {count} tasks, maximum is {max}")]
    TooManyTasks { count: usize, max: usize },

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("duplicate channel id: {0}")]
    DuplicateChannel(String),

    #[error("task {task}: slot {slot} is declared as both input and output")]
    SlotDirectionConflict { task: String, slot: String },

    #[error("task {task}: slot {slot} is assigned a channel but never declared")]
    UndeclaredSlot { task: String, slot: String },

    #[error("task {task}: channel {channel} is not declared in the graph")]
    UnknownChannel { task: String, channel: String },
}

#[derive(Debug, Error)]
pub enum GraphflowError {
    // Request errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Graph not found: {0}")]
    NotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Graph state for {graph_id} was modified concurrently (expected version {expected})")]
    StateConflict { graph_id: String, expected: u64 },

    // Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Scheduler rejected task {task_id}: {reason}")]
    SchedulerRejected { task_id: String, reason: String },

    // Engine errors
    #[error("Graph plan error: {0}")]
    Plan(String),

    #[error("Engine is shutting down")]
    EngineShutdown,

    #[error("Graph {graph_id} could not be started: {reason}")]
    StartFailed { graph_id: String, reason: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphflowError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphflowError::Database(_) | GraphflowError::Scheduler(_))
    }
}

pub type Result<T> = std::result::Result<T, GraphflowError>;
