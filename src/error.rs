//! Error taxonomy for the execution engine.
//!
//! Every variant is caught at the engine boundary and folded into an
//! `ExecutionResult` with `status = "error"`; only [`UnknownOperation`]
//! travels back to the transport as a distinct value.

use std::time::Duration;

use serde::Serialize;

/// Classified failure of a single execution request.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed or missing request fields. Raised before any resource exists.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// User code tried to load a module on the blocklist.
    #[error("Blocked import: module '{module}' is not allowed in this sandbox")]
    BlockedImport { module: String },

    /// Execution exceeded its wall-clock budget and was killed.
    #[error("Execution timed out after {}s (limit {limit_seconds}s)", elapsed.as_secs())]
    Timeout { elapsed: Duration, limit_seconds: u64 },

    /// A preview port could not be bound or is already registered.
    #[error("Cannot bind preview port {port}: {reason}")]
    ResourceBind { port: u16, reason: String },

    /// Build or run failure not otherwise classified.
    #[error("Backend failure: {0}")]
    Backend(String),

    /// User program ran to completion but exited unsuccessfully.
    #[error("Program exited with status {exit_code}")]
    Program { exit_code: i32 },
}

impl SandboxError {
    /// The serializable classification of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::BlockedImport { .. } => ErrorKind::BlockedImportError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::ResourceBind { .. } => ErrorKind::ResourceBindError,
            Self::Backend(_) => ErrorKind::BackendError,
            Self::Program { .. } => ErrorKind::ProgramError,
        }
    }
}

impl From<anyhow::Error> for SandboxError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line, no backtrace.
        Self::Backend(format!("{err:#}"))
    }
}

/// Tool name that is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown tool: {0}")]
pub struct UnknownOperation(pub String);

/// Classification reported alongside `status = "error"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ValidationError,
    BlockedImportError,
    TimeoutError,
    ResourceBindError,
    BackendError,
    ProgramError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_elapsed_and_limit() {
        let err = SandboxError::Timeout {
            elapsed: Duration::from_millis(2100),
            limit_seconds: 2,
        };
        assert_eq!(err.to_string(), "Execution timed out after 2s (limit 2s)");
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
    }

    #[test]
    fn blocked_import_names_the_module() {
        let err = SandboxError::BlockedImport {
            module: "os".into(),
        };
        assert!(err.to_string().contains("'os'"));
        assert_eq!(err.kind(), ErrorKind::BlockedImportError);
    }

    #[test]
    fn anyhow_chain_becomes_backend_error() {
        let err: SandboxError = anyhow::anyhow!("inner")
            .context("Failed to spawn docker")
            .into();
        assert_eq!(err.kind(), ErrorKind::BackendError);
        assert_eq!(err.to_string(), "Backend failure: Failed to spawn docker: inner");
    }

    #[test]
    fn kind_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::ResourceBindError).unwrap();
        assert_eq!(json, "\"ResourceBindError\"");
    }
}
