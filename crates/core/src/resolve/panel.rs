//! Queue driver for conflict resolution.
//!
//! [`ResolvePanel`] owns the per-item conflict list and its statuses, runs
//! one [`ResolveManager`] at a time over the queue, and publishes everything
//! the UI needs as [`PanelEvent`]s on a broadcast channel. The
//! [`session`](crate::session) runner drives it headlessly; a desktop shell
//! binds the same surface to widgets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::events::{ResolveEvent, ResolveOutcome};
use super::handlers::{
    AmFinalizeHandler, AssistantHandler, CherryPickFinalizeHandler, MergetoolHandler,
};
use super::manager::ResolveManager;
use super::{EventSink, ResolveContext, ResolveHandler, ResolveOperation};
use crate::assist::Assistant;
use crate::config::ResolveConfig;
use crate::git::{ConfigScope, GitClient};
use crate::tasks::TaskRunner;

const EVENT_CAPACITY: usize = 256;

/// What the panel knows about one conflicted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Resolved,
    Failed,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The operation the panel is resolving conflicts for.
#[derive(Debug, Clone)]
pub struct PanelContext {
    pub repo_dir: PathBuf,
    pub operation: ResolveOperation,
    /// Commit being applied, for prompts and assistant context.
    pub sha1: String,
    /// Error text from the command that produced the conflicts.
    pub initial_error: Option<String>,
    /// Free-form context forwarded to the assistant.
    pub extra_context: Option<String>,
}

/// Everything the panel publishes to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelEvent {
    StatusText(String),
    /// `Some` right before a file's chain starts, `None` whenever the queue
    /// stops (drained, failed, or aborted).
    CurrentFileChanged(Option<String>),
    ConflictFilesChanged(Vec<String>),
    /// Event forwarded from the manager currently running.
    Resolve(ResolveEvent),
    FileOutcome {
        path: String,
        outcome: ResolveOutcome,
    },
    FinalizeOutcome(ResolveOutcome),
    /// The queue is idle and it is safe to abort the git operation.
    AbortSafePointReached,
    AutoResolveToggled(bool),
}

#[derive(Default)]
struct PanelState {
    context: Option<PanelContext>,
    files: Vec<String>,
    statuses: HashMap<String, FileStatus>,
    current: Option<Arc<ResolveManager>>,
    /// `None` until probed; `Some(None)` when the repo has no `merge.tool`.
    probed_tool: Option<Option<String>>,
}

struct PanelInner {
    tasks: TaskRunner,
    git: GitClient,
    config: ResolveConfig,
    assistant: Option<Arc<dyn Assistant>>,
    events: broadcast::Sender<PanelEvent>,
    state: Mutex<PanelState>,
    busy: AtomicBool,
    abort_requested: AtomicBool,
    auto_resolve: AtomicBool,
    warned_no_resolver: AtomicBool,
}

/// Headless conflict-resolution queue.
#[derive(Clone)]
pub struct ResolvePanel {
    inner: Arc<PanelInner>,
}

impl ResolvePanel {
    pub fn new(
        tasks: TaskRunner,
        git: GitClient,
        config: ResolveConfig,
        assistant: Option<Arc<dyn Assistant>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let auto_resolve = config.auto_resolve;
        Self {
            inner: Arc::new(PanelInner {
                tasks,
                git,
                config,
                assistant,
                events,
                state: Mutex::new(PanelState::default()),
                busy: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
                auto_resolve: AtomicBool::new(auto_resolve),
                warned_no_resolver: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.inner.events.subscribe()
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.inner.tasks.clone()
    }

    /// Point the panel at a new item. Clears files, statuses and the abort
    /// latch; refused while the queue is running.
    pub fn prepare(&self, context: PanelContext) {
        if self.inner.busy.load(Ordering::SeqCst) {
            warn!("prepare called while the resolve queue is running; ignored");
            return;
        }
        let mut state = self.inner.lock_state();
        state.context = Some(context);
        state.files.clear();
        state.statuses.clear();
        state.current = None;
        state.probed_tool = None;
        drop(state);
        self.inner.abort_requested.store(false, Ordering::SeqCst);
    }

    /// Replace the conflict list. Statuses of retained paths survive, new
    /// paths start pending. Identical input is a no-op.
    pub fn set_conflict_files(&self, paths: Vec<String>) {
        let mut state = self.inner.lock_state();
        if state.files == paths {
            return;
        }
        let mut statuses = HashMap::with_capacity(paths.len());
        for path in &paths {
            let status = state
                .statuses
                .get(path)
                .copied()
                .unwrap_or(FileStatus::Pending);
            statuses.insert(path.clone(), status);
        }
        state.files = paths.clone();
        state.statuses = statuses;
        drop(state);
        self.inner.emit(PanelEvent::ConflictFilesChanged(paths));
    }

    /// Queue every unresolved file and work through them sequentially.
    /// Previously failed files are retried. Returns whether the queue
    /// actually started.
    #[instrument(skip(self))]
    pub fn start_resolve_all(&self) -> bool {
        if !self.inner.try_start() {
            return false;
        }
        let queue = {
            let mut state = self.inner.lock_state();
            for status in state.statuses.values_mut() {
                if *status == FileStatus::Failed {
                    *status = FileStatus::Pending;
                }
            }
            state
                .files
                .iter()
                .filter(|p| state.statuses.get(*p) == Some(&FileStatus::Pending))
                .cloned()
                .collect::<Vec<_>>()
        };
        self.inner.spawn_queue(queue);
        true
    }

    /// Queue a single file (user retry). Returns whether it started.
    #[instrument(skip(self))]
    pub fn start_resolve_file(&self, path: &str) -> bool {
        if !self.inner.try_start() {
            return false;
        }
        let known = {
            let mut state = self.inner.lock_state();
            if state.files.iter().any(|p| p == path) {
                state.statuses.insert(path.to_string(), FileStatus::Pending);
                true
            } else {
                false
            }
        };
        if !known {
            warn!(path, "cannot resolve unknown file");
            self.inner.busy.store(false, Ordering::SeqCst);
            return false;
        }
        self.inner.spawn_queue(vec![path.to_string()]);
        true
    }

    /// Run the finalize step (continue the surrounding operation).
    #[instrument(skip(self))]
    pub fn start_finalize(&self) -> bool {
        if !self.inner.try_start() {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_finalize().await;
        });
        true
    }

    /// Forward a prompt answer to the manager currently running. Returns
    /// whether a manager accepted it.
    pub fn reply_prompt(&self, prompt_id: u64, choice: &str) -> bool {
        let manager = self.inner.lock_state().current.clone();
        match manager {
            Some(manager) => manager.reply_prompt(prompt_id, choice),
            None => {
                debug!(prompt_id, "prompt reply with no active resolution");
                false
            }
        }
    }

    /// Ask the queue to stop at the next file boundary. Idempotent. The
    /// running step is cancelled; `AbortSafePointReached` follows once the
    /// queue is idle (immediately when it already is).
    #[instrument(skip(self))]
    pub fn request_abort_safely(&self) {
        if self.inner.abort_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.emit(PanelEvent::StatusText(
            "abort requested; stopping at the next safe point".to_string(),
        ));
        let manager = self.inner.lock_state().current.clone();
        if let Some(manager) = manager {
            manager.cancel();
        }
        if !self.inner.busy.load(Ordering::SeqCst) {
            self.inner.emit(PanelEvent::AbortSafePointReached);
        }
    }

    pub fn set_auto_resolve(&self, enabled: bool) {
        self.inner.auto_resolve.store(enabled, Ordering::SeqCst);
        self.inner.emit(PanelEvent::AutoResolveToggled(enabled));
    }

    pub fn auto_resolve(&self) -> bool {
        self.inner.auto_resolve.load(Ordering::SeqCst)
    }

    /// Snapshot of the conflict list in order.
    pub fn files(&self) -> Vec<(String, FileStatus)> {
        let state = self.inner.lock_state();
        state
            .files
            .iter()
            .map(|p| {
                let status = state
                    .statuses
                    .get(p)
                    .copied()
                    .unwrap_or(FileStatus::Pending);
                (p.clone(), status)
            })
            .collect()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }
}

impl PanelInner {
    fn lock_state(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: PanelEvent) {
        let _ = self.events.send(event);
    }

    /// Claim the busy flag, refusing while latched for abort. The spawned
    /// task releases the flag when the queue stops.
    fn try_start(&self) -> bool {
        if self.abort_requested.load(Ordering::SeqCst) {
            warn!("start refused: abort requested");
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("start refused: resolve queue already running");
            return false;
        }
        true
    }

    fn spawn_queue(self: &Arc<Self>, queue: Vec<String>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process_queue(queue).await;
        });
    }

    async fn process_queue(self: &Arc<Self>, queue: Vec<String>) {
        for path in queue {
            if self.abort_requested.load(Ordering::SeqCst) {
                break;
            }
            self.emit(PanelEvent::CurrentFileChanged(Some(path.clone())));
            let outcome = self.resolve_one(&path).await;
            let resolved = outcome.is_resolved();
            {
                let mut state = self.lock_state();
                state.statuses.insert(
                    path.clone(),
                    if resolved {
                        FileStatus::Resolved
                    } else {
                        FileStatus::Failed
                    },
                );
                state.current = None;
            }
            self.emit(PanelEvent::FileOutcome { path, outcome });
            if !resolved {
                break;
            }
        }
        self.busy.store(false, Ordering::SeqCst);
        self.emit(PanelEvent::CurrentFileChanged(None));
        if self.abort_requested.load(Ordering::SeqCst) {
            self.emit(PanelEvent::AbortSafePointReached);
        }
    }

    async fn resolve_one(self: &Arc<Self>, path: &str) -> ResolveOutcome {
        let context = self.lock_state().context.clone();
        let Some(context) = context else {
            return ResolveOutcome::failed("resolve panel was not prepared");
        };

        let tool = self.mergetool_for(&context.repo_dir, path).await;
        let mut handlers: Vec<Box<dyn ResolveHandler>> = Vec::new();
        if self.assistant.is_some() && self.auto_resolve.load(Ordering::SeqCst) {
            handlers.push(Box::new(AssistantHandler::new()));
        }
        if tool.is_some() {
            handlers.push(Box::new(MergetoolHandler::new()));
        }
        if handlers.is_empty() && !self.warned_no_resolver.swap(true, Ordering::SeqCst) {
            self.emit(PanelEvent::StatusText(
                "no merge tool configured and auto-resolve is off; conflicts must be resolved by hand"
                    .to_string(),
            ));
        }

        let ctx = ResolveContext {
            repo_dir: context.repo_dir.clone(),
            operation: context.operation,
            sha1: context.sha1.clone(),
            path: Some(path.to_string()),
            initial_error: context.initial_error.clone(),
            mergetool: tool,
            extra_context: context.extra_context.clone(),
        };
        self.run_manager(handlers, ctx).await
    }

    async fn run_finalize(self: &Arc<Self>) {
        let context = self.lock_state().context.clone();
        let outcome = match context {
            None => ResolveOutcome::failed("resolve panel was not prepared"),
            Some(context) => {
                let handlers: Vec<Box<dyn ResolveHandler>> = match context.operation {
                    ResolveOperation::CherryPick => {
                        vec![Box::new(CherryPickFinalizeHandler::new())]
                    }
                    ResolveOperation::Am => vec![Box::new(AmFinalizeHandler::new())],
                    // Merge finalization (committing the merge) stays with
                    // the user; the manager reports the gap.
                    ResolveOperation::Merge => Vec::new(),
                };
                let ctx = ResolveContext {
                    repo_dir: context.repo_dir.clone(),
                    operation: context.operation,
                    sha1: context.sha1.clone(),
                    path: None,
                    initial_error: context.initial_error.clone(),
                    mergetool: None,
                    extra_context: context.extra_context.clone(),
                };
                self.run_manager(handlers, ctx).await
            }
        };
        self.lock_state().current = None;
        self.busy.store(false, Ordering::SeqCst);
        self.emit(PanelEvent::FinalizeOutcome(outcome));
        if self.abort_requested.load(Ordering::SeqCst) {
            self.emit(PanelEvent::AbortSafePointReached);
        }
    }

    async fn run_manager(
        self: &Arc<Self>,
        handlers: Vec<Box<dyn ResolveHandler>>,
        ctx: ResolveContext,
    ) -> ResolveOutcome {
        let manager = Arc::new(ResolveManager::new(
            handlers,
            self.tasks.clone(),
            self.git.clone(),
            self.assistant.clone(),
            self.event_sink(),
        ));
        self.lock_state().current = Some(Arc::clone(&manager));
        // An abort that raced in between queue check and registration must
        // still reach this manager.
        if self.abort_requested.load(Ordering::SeqCst) {
            manager.cancel();
        }
        manager.run(ctx).await
    }

    fn event_sink(self: &Arc<Self>) -> EventSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            let _ = events.send(PanelEvent::Resolve(event));
        })
    }

    /// Merge tool for a path: configured suffix match, then the configured
    /// global tool, then the repository's own `merge.tool`.
    async fn mergetool_for(self: &Arc<Self>, repo_dir: &Path, path: &str) -> Option<String> {
        if let Some(tool) = self.config.tool_for_path(path) {
            return Some(tool.to_string());
        }
        if let Some(cached) = self.lock_state().probed_tool.clone() {
            return cached;
        }
        let git = self.git.clone();
        let repo = repo_dir.to_path_buf();
        let probed = self
            .tasks
            .call(move || git.config_value(Some(&repo), "merge.tool", ConfigScope::Effective))
            .await
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        self.lock_state().probed_tool = Some(probed.clone());
        probed
    }
}
