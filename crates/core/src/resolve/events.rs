//! Event, prompt, and outcome vocabulary for the resolution pipeline.
//!
//! Everything here crosses the UI boundary, so the types are plain data
//! with serde derives and snake_case wire names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal status of a resolution run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The step succeeded; the pipeline may continue.
    Resolved,
    /// Recoverable, but a person has to act before retrying.
    NeedsUser,
    /// The user (or a cancel) stopped the step.
    Aborted,
    /// The step failed and the pipeline cannot recover on its own.
    Failed,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::NeedsUser => write!(f, "needs_user"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one resolution run (a single file, or the finalize step).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub status: OutcomeStatus,
    pub message: Option<String>,
    /// Paths still conflicted after the run, when the step knows them.
    pub remaining_conflicts: Option<Vec<String>>,
}

impl ResolveOutcome {
    pub fn resolved() -> Self {
        Self {
            status: OutcomeStatus::Resolved,
            message: None,
            remaining_conflicts: None,
        }
    }

    pub fn resolved_with(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Resolved,
            message: Some(message.into()),
            remaining_conflicts: None,
        }
    }

    pub fn needs_user(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::NeedsUser,
            message: Some(message.into()),
            remaining_conflicts: None,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Aborted,
            message: Some(message.into()),
            remaining_conflicts: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            message: Some(message.into()),
            remaining_conflicts: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == OutcomeStatus::Resolved
    }
}

/// How a file got fixed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMethod {
    /// Blob-identity shortcut, no content work needed.
    Trivial,
    /// The assistant rewrote the file.
    Assistant,
    /// An external merge tool was driven to completion.
    MergeTool,
}

impl std::fmt::Display for ResolveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trivial => write!(f, "trivial"),
            Self::Assistant => write!(f, "assistant"),
            Self::MergeTool => write!(f, "merge_tool"),
        }
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// What kind of decision a prompt asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// The merge tool wants confirmation before it opens.
    RunMergetoolConfirm,
    /// One side deleted the file; pick created/modified/deleted/abort.
    DeletedConflictChoice,
    /// Symbolic link conflict; pick local/remote/abort.
    SymlinkConflictChoice,
    /// Finalize hit an empty commit; pick skip/allow-empty/abort.
    EmptyCommitChoice,
}

/// An interactive question surfaced to the user mid-run.
///
/// `options` are opaque answer tokens; the reply must be one of them. Ids
/// increase monotonically within the handler that asked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvePrompt {
    pub id: u64,
    pub kind: PromptKind,
    pub title: String,
    pub text: String,
    pub options: Vec<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress stream of one resolution run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolveEvent {
    /// A run began. `path` is `None` for the finalize step.
    Started { run_id: Uuid, path: Option<String> },
    /// A pipeline stage began.
    Step { text: String },
    /// Free-form progress within a stage.
    Progress { text: String },
    /// A handler needs an answer to continue.
    Prompt(ResolvePrompt),
    /// A file left the conflicted state.
    FileResolved { path: String, method: ResolveMethod },
    /// The run finished; exactly one per start.
    Completed(ResolveOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(OutcomeStatus::Resolved.to_string(), "resolved");
        assert_eq!(OutcomeStatus::NeedsUser.to_string(), "needs_user");
        assert_eq!(OutcomeStatus::Aborted.to_string(), "aborted");
        assert_eq!(OutcomeStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(ResolveOutcome::resolved().is_resolved());
        assert!(ResolveOutcome::resolved().message.is_none());

        let failed = ResolveOutcome::failed("no resolver");
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert_eq!(failed.message.as_deref(), Some("no resolver"));
        assert!(!failed.is_resolved());
    }

    #[test]
    fn test_prompt_serializes_snake_case() {
        let prompt = ResolvePrompt {
            id: 3,
            kind: PromptKind::EmptyCommitChoice,
            title: "Empty commit".into(),
            text: "The pick is now empty.".into(),
            options: vec!["skip".into(), "allow-empty".into(), "abort".into()],
        };
        let json = serde_json::to_string(&prompt).unwrap();
        assert!(json.contains("\"empty_commit_choice\""));

        let back: ResolvePrompt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prompt);
    }

    #[test]
    fn test_event_serializes() {
        let event = ResolveEvent::FileResolved {
            path: "src/app.c".into(),
            method: ResolveMethod::Trivial,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("file_resolved"));
        assert!(json.contains("trivial"));
    }
}
