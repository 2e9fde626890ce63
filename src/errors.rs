use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Infrastructure faults of the execution subprocess.
///
/// Faults raised *by the executed snippet* never appear here; the child
/// converts them into a failure [`crate::executor::ExecOutcome`] instead.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Execution timeout exceeded")]
    Timeout,

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Process killed by signal {0}")]
    ProcessKilled(i32),

    #[error("Result channel corrupt or missing: {0}")]
    ChannelCorrupt(String),

    #[error("Runtime error during execution: {0}")]
    RuntimeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Request-level errors of the serving pipeline.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Please set OPENAI_API_KEY in a .env file (or as an environment variable).")]
    MissingApiKey,

    #[error("Error calling the model API: {0}")]
    Service(String),

    #[error("Failed to load dataset: {0}")]
    Dataset(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
