//! Error types for the Gitwing core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from spawning the `git` CLI.
///
/// A `git` command that runs and exits non-zero is *not* an error at this
/// level; callers receive the exit code and stderr as data and decide what
/// it means for their flow. Only failures to run the command at all land
/// here.
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// The child process could not be spawned or its output collected.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Task runner errors
// ---------------------------------------------------------------------------

/// Errors delivered by [`crate::tasks::TaskRunner`] jobs.
///
/// Job failures are stringified at the delivery boundary so handles stay
/// uniform regardless of what the worker closure returned.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The worker closure returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The worker closure panicked; the panic was contained.
    #[error("task panicked: {0}")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Errors from the cherry-pick session runner.
///
/// Runtime outcomes (picked, failed, aborted items) travel in the session
/// summary, not here; this covers misuse of the runner itself.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `run` was called on a session that already ran.
    #[error("cherry-pick session already started")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::BinaryNotFound("No such file or directory".into());
        assert_eq!(
            err.to_string(),
            "git binary not found: No such file or directory"
        );

        let err = TaskError::Failed("exit 128".into());
        assert_eq!(err.to_string(), "task failed: exit 128");

        let err = TaskError::Panicked("index out of bounds".into());
        assert!(err.to_string().contains("panicked"));

        let err = ConfigError::InvalidValue {
            field: "resolve.mergetool_by_suffix".into(),
            detail: "empty suffix".into(),
        };
        assert!(err.to_string().contains("resolve.mergetool_by_suffix"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let git_err = GitError::BinaryNotFound("not found".into());
        let core_err: CoreError = git_err.into();
        assert!(matches!(core_err, CoreError::Git(_)));

        let task_err = TaskError::Failed("boom".into());
        let core_err: CoreError = task_err.into();
        assert!(matches!(core_err, CoreError::Task(_)));

        let err = SessionError::AlreadyStarted;
        let core_err: CoreError = err.into();
        assert!(matches!(core_err, CoreError::Session(_)));
    }
}
