//! Error types for the execution engine.
//!
//! The taxonomy distinguishes failures of the submitted code (the program
//! raised an error) from failures of the execution environment itself (a
//! runtime could not be spawned, a process died, a kernel connection broke).
//! Callers receive every variant as a terminal error chunk rather than a
//! panic or a silently dropped stream, so the distinction survives all the
//! way to the user.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Language not supported: {0}")]
    LanguageNotSupported(String),
    #[error("Session for '{language}' is already executing")]
    SessionBusy { language: String },
    #[error("Failed to start runtime for '{language}': {message}")]
    ProcessSpawnFailed { language: String, message: String },
    #[error("Code execution failed: {0}")]
    ExecutionRuntimeError(String),
    #[error("Runtime for '{language}' exited unexpectedly: {message}")]
    ProcessCrashed { language: String, message: String },
    #[error("Execution cancelled")]
    Cancelled,
    #[error("Kernel protocol error: {0}")]
    KernelProtocol(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

impl EngineError {
    /// Human-readable text for a terminal error chunk.
    ///
    /// Distinguishes "your code raised an error" from "the execution
    /// environment itself failed" so callers can relay the right message.
    pub fn chunk_text(&self) -> String {
        match self {
            EngineError::ExecutionRuntimeError(detail) => {
                format!("Your code raised an error:\n{}", detail)
            }
            EngineError::Cancelled => "Execution was cancelled before any code ran.".to_string(),
            EngineError::SessionBusy { language } => format!(
                "The {} session is still executing a previous request. \
                 Wait for it to finish or cancel it first.",
                language
            ),
            EngineError::LanguageNotSupported(language) => {
                format!("The execution environment does not support '{}'.", language)
            }
            other => format!("The execution environment failed: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_code_errors_are_attributed_to_the_code() {
        let err = EngineError::ExecutionRuntimeError("ZeroDivisionError".to_string());
        assert!(err.chunk_text().starts_with("Your code raised an error"));
    }

    #[test]
    fn test_environment_errors_are_attributed_to_the_environment() {
        let err = EngineError::ProcessCrashed {
            language: "python".to_string(),
            message: "exit status 137".to_string(),
        };
        assert!(err.chunk_text().contains("execution environment failed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::IoError(_)));
    }
}
