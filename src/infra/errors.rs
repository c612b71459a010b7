// src/infra/errors.rs — Error types for Ouro

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CycleError {
    // Missing/invalid configuration — reported to the caller, no state change
    #[error("Configuration error: {0}")]
    FatalConfig(String),

    // API errors (retriable up to the configured limit)
    #[error("API error: {message}")]
    Api { message: String, retriable: bool },

    #[error("Response parse error: {0}")]
    Parse(String),

    // Tool failures are fed back to the model as a function-error entry;
    // this variant crosses the ToolRunner boundary, not the cycle loop
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    // User-initiated cancellation, distinguished from failure
    #[error("Cycle aborted")]
    Aborted,

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CycleError {
    /// Whether the iteration retry loop may attempt this error again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CycleError::Api { retriable: true, .. }
                | CycleError::Parse(_)
                | CycleError::ToolExecution { .. }
        )
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, CycleError::Aborted)
    }
}
