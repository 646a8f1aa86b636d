//! Error types for ChainFlow

use thiserror::Error;

/// ChainFlow error types
#[derive(Error, Debug)]
pub enum ChainFlowError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// YAML size exceeded limit
    #[error("Graph spec YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Unit count exceeded limit
    #[error("Work unit count {count} exceeds limit of {limit}")]
    UnitCountExceeded { count: usize, limit: usize },

    /// Name validation error (task, work name or tag)
    #[error("Name '{name}' exceeds {max} characters")]
    NameTooLong { name: String, max: usize },

    /// Invalid name format
    #[error("Invalid name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidName { name: String },

    /// Graph has no stages
    #[error("Graph must contain at least one stage")]
    EmptyGraph,

    /// A stage has no units
    #[error("Stage {stage} contains no work units")]
    EmptyStage { stage: usize },

    /// The same work request was placed twice
    #[error("Work request {id} appears more than once in the graph")]
    DuplicateUnit { id: String },

    /// No task function registered under this name
    #[error("No task function registered as '{task}'")]
    UnknownTask { task: String },

    /// A task function was registered twice
    #[error("Task function '{task}' is already registered")]
    DuplicateTask { task: String },

    /// Data mapping exceeded the serialized size limit
    #[error("Data size {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge { size: usize, limit: usize },

    /// Engine configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine constructed outside of a tokio runtime
    #[error("Work engine must be created inside a tokio runtime")]
    NoRuntime,

    /// Submission or observation after shutdown
    #[error("Work engine has been shut down")]
    EngineShutdown,

    /// Rendered metrics were not valid UTF-8
    #[error("Metrics encoding error: {0}")]
    MetricsEncoding(#[from] std::string::FromUtf8Error),
}

/// Result type alias using ChainFlowError
pub type Result<T> = std::result::Result<T, ChainFlowError>;
