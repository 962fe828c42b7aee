//! Conflict resolution pipeline.
//!
//! The pipeline is a chain of pluggable handlers tried in order for each
//! step. A step is either one conflicted file or the finalize action that
//! concludes the whole operation. [`manager::ResolveManager`] drives the
//! chain for a single step; [`panel::ResolvePanel`] owns the file queue and
//! creates one manager per step. Interactive questions travel up as prompt
//! events and answers come back through the same manager.

pub mod events;
pub mod excerpt;
pub mod handlers;
pub mod manager;
pub mod panel;
pub mod prompts;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::assist::Assistant;
use crate::git::GitClient;
use crate::tasks::TaskRunner;

pub use events::{
    OutcomeStatus, PromptKind, ResolveEvent, ResolveMethod, ResolveOutcome, ResolvePrompt,
};
pub use manager::ResolveManager;
pub use panel::{PanelContext, PanelEvent, ResolvePanel};
pub use prompts::{PromptGate, PromptSink};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Which Git operation produced the conflicts being resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOperation {
    Merge,
    CherryPick,
    Am,
}

impl std::fmt::Display for ResolveOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::CherryPick => write!(f, "cherry-pick"),
            Self::Am => write!(f, "am"),
        }
    }
}

/// Everything a handler needs to know about the step it is offered.
/// Immutable once a run starts.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Repository (or submodule) the operation runs in.
    pub repo_dir: PathBuf,
    /// Operation that produced the conflicts.
    pub operation: ResolveOperation,
    /// Commit being applied.
    pub sha1: String,
    /// Conflicted path relative to `repo_dir`; `None` for the finalize step.
    pub path: Option<String>,
    /// Error text from the command that started the operation, if any.
    pub initial_error: Option<String>,
    /// Merge tool chosen for this file, if any.
    pub mergetool: Option<String>,
    /// Extra caller-supplied context forwarded to the assistant.
    pub extra_context: Option<String>,
}

// ---------------------------------------------------------------------------
// Handler chain protocol
// ---------------------------------------------------------------------------

/// What a handler did with the step it was offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Not this handler's kind of step; the chain moves on.
    Pass,
    /// The step was handled; the outcome decides whether the chain
    /// continues (resolved) or stops (anything else).
    Handled(ResolveOutcome),
}

/// Synchronous event callback. All emissions of one run go through a single
/// sink, so observers see them in call order.
pub type EventSink = Arc<dyn Fn(ResolveEvent) + Send + Sync>;

/// Capabilities handed to a handler for one run.
#[derive(Clone)]
pub struct ResolveServices {
    pub tasks: TaskRunner,
    pub git: GitClient,
    pub assistant: Option<Arc<dyn Assistant>>,
    pub prompts: PromptSink,
    pub cancel: CancelFlag,
    pub events: EventSink,
}

impl ResolveServices {
    pub fn emit(&self, event: ResolveEvent) {
        (self.events)(event);
    }

    pub fn step(&self, text: impl Into<String>) {
        self.emit(ResolveEvent::Step { text: text.into() });
    }

    pub fn progress(&self, text: impl Into<String>) {
        self.emit(ResolveEvent::Progress { text: text.into() });
    }

    pub fn file_resolved(&self, path: impl Into<String>, method: ResolveMethod) {
        self.emit(ResolveEvent::FileResolved {
            path: path.into(),
            method,
        });
    }
}

/// One pluggable resolution strategy.
///
/// A handler inspects the step and either passes or handles it, emitting at
/// most one terminal verdict per start. Long-running work must watch
/// `services.cancel` so an abort lands at the next await point instead of
/// interrupting a Git command mid-flight.
#[async_trait]
pub trait ResolveHandler: Send {
    /// Short stable name used in step events and logs.
    fn name(&self) -> &'static str;

    async fn run(&mut self, ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation token shared by a run and its owner.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once [`cancel`](Self::cancel) has been called; immediately
    /// when it already was.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            // Registering before the re-check closes the set-then-notify gap.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
