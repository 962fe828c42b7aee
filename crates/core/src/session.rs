//! Cherry-pick session runner.
//!
//! Drives an ordered list of commits through cherry-pick, falling back to a
//! patch apply when the target repository lacks the object, handing
//! conflicts to the [`ResolvePanel`] and finalizing before moving on. The
//! session is a state machine over one cursor: an item either ends terminal
//! (picked, failed, aborted) or parks in `NeedsResolution` while the user
//! works through the panel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::errors::SessionError;
use crate::git::GitClient;
use crate::resolve::{
    OutcomeStatus, PanelContext, PanelEvent, ResolveOperation, ResolvePanel,
};
use crate::tasks::TaskRunner;

const EVENT_CAPACITY: usize = 256;
const BAD_OBJECT: &str = "fatal: bad object";

/// Sentinel sha1 for "apply the uncommitted local changes" pseudo-items.
pub const LOCAL_UNCOMMITTED_SHA1: &str = "0000000000000000000000000000000000000001";
/// Sentinel sha1 for "apply the committed-but-unpushed local changes".
pub const LOCAL_COMMITTED_SHA1: &str = "0000000000000000000000000000000000000002";

/// One commit to pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickItem {
    pub sha1: String,
    /// Submodule path relative to the repository roots; `None` = root repo.
    #[serde(default)]
    pub repo_dir: Option<String>,
    /// Caller-side correlation index (e.g. a row in the picker UI).
    #[serde(default)]
    pub source_index: Option<usize>,
}

impl PickItem {
    pub fn new(sha1: impl Into<String>) -> Self {
        Self {
            sha1: sha1.into(),
            repo_dir: None,
            source_index: None,
        }
    }
}

/// Where one item stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Picked,
    /// Parked while the user resolves conflicts; may still advance.
    NeedsResolution,
    Failed,
    Aborted,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Picked => write!(f, "picked"),
            Self::NeedsResolution => write!(f, "needs_resolution"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Everything the session publishes to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    StatusText(String),
    Progress {
        completed: usize,
        total: usize,
    },
    ItemStarted {
        index: usize,
        sha1: String,
    },
    ItemStatus {
        index: usize,
        status: ItemStatus,
        message: String,
    },
    ConflictsDetected {
        operation: ResolveOperation,
        files: Vec<String>,
    },
    Finished(SessionSummary),
}

/// Terminal report of one session run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub ok: bool,
    pub aborted: bool,
    /// True iff at least one item was picked; the caller's views are stale.
    pub need_reload: bool,
    pub message: String,
    pub picked: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Applies the local-changes pseudo-commits (stash transfer, patch of the
/// working tree, whatever the embedder decided those sentinels mean).
#[async_trait]
pub trait LocalChangesApplier: Send + Sync {
    /// `Ok(true)` = applied; `Ok(false)` = not applied (treated as a
    /// terminal failure, like an error).
    async fn apply(
        &self,
        target_repo: &Path,
        sha1: &str,
        source_repo: Option<&Path>,
    ) -> anyhow::Result<bool>;
}

/// Pure observer notified once per picked/failed item. Panics are contained.
pub trait PickMarker: Send + Sync {
    fn mark(&self, sha1: &str, ok: bool);
}

/// Behaviour switches for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pass `-x` to cherry-pick so the origin sha is recorded.
    pub record_origin: bool,
    /// Allow the patch-apply fallback when the object is missing locally.
    pub allow_patch_pick: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            record_origin: true,
            allow_patch_pick: true,
        }
    }
}

/// Repo dirs one item operates on, with the submodule path applied.
struct ActiveStep {
    target: PathBuf,
    source: Option<PathBuf>,
}

/// How one item ended. `NeedsResolution` is not terminal and never leaves
/// the conflict phase.
enum ItemEnd {
    Picked,
    /// Terminal for the whole session.
    Failed(String),
    /// Abort honored; any in-progress operation is already cleaned up.
    Aborted(String),
}

/// Single-use driver for one list of picks.
pub struct CherryPickSession {
    panel: ResolvePanel,
    git: GitClient,
    tasks: TaskRunner,
    target_base: PathBuf,
    source_base: Option<PathBuf>,
    options: SessionOptions,
    applier: Option<Arc<dyn LocalChangesApplier>>,
    marker: Option<Arc<dyn PickMarker>>,
    events: broadcast::Sender<SessionEvent>,
    started: AtomicBool,
    finished: AtomicBool,
    abort_flag: AtomicBool,
}

impl CherryPickSession {
    /// The session shares the panel's task runner, as the panel outlives it.
    pub fn new(
        panel: ResolvePanel,
        git: GitClient,
        target_base: PathBuf,
        options: SessionOptions,
    ) -> Self {
        let tasks = panel.task_runner();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            panel,
            git,
            tasks,
            target_base,
            source_base: None,
            options,
            applier: None,
            marker: None,
            events,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            abort_flag: AtomicBool::new(false),
        }
    }

    /// Repository the picked commits come from, enabling patch-pick.
    pub fn with_source_repo(mut self, dir: PathBuf) -> Self {
        self.source_base = Some(dir);
        self
    }

    pub fn with_local_changes_applier(mut self, applier: Arc<dyn LocalChangesApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_pick_marker(mut self, marker: Arc<dyn PickMarker>) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop at the next safe point. Never interrupts a git command
    /// mid-flight; a running resolution is cancelled through the panel.
    /// Idempotent.
    pub fn request_abort_safely(&self) {
        if self.abort_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session abort requested");
        self.emit(SessionEvent::StatusText(
            "abort requested; waiting for a safe point".to_string(),
        ));
        self.panel.request_abort_safely();
    }

    /// Work through `items` in order. Emits `Finished` exactly once and
    /// returns the same summary. A session runs once; further calls fail.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn run(&self, items: Vec<PickItem>) -> Result<SessionSummary, SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        let started_at = Utc::now();
        let total = items.len();
        if items.is_empty() {
            return Ok(self.finish(true, false, "nothing to pick", 0, 0, started_at));
        }
        self.emit(SessionEvent::StatusText(format!("picking {total} commits")));

        let mut picked = 0usize;
        let mut failed = 0usize;
        let mut completed = 0usize;
        for (index, item) in items.iter().enumerate() {
            if self.abort_requested() {
                return Ok(self.finish_aborted_from(
                    index,
                    &items,
                    completed,
                    picked,
                    failed,
                    started_at,
                    "session aborted",
                ));
            }
            self.emit(SessionEvent::ItemStarted {
                index,
                sha1: item.sha1.clone(),
            });
            self.emit(SessionEvent::StatusText(format!(
                "applying {} ({}/{})",
                short_sha(&item.sha1),
                index + 1,
                total
            )));

            let step = self.active_step(item);
            let end = self.run_item(index, item, &step).await;
            completed += 1;
            match end {
                ItemEnd::Picked => {
                    picked += 1;
                    self.mark_item(&item.sha1, true);
                    self.emit(SessionEvent::ItemStatus {
                        index,
                        status: ItemStatus::Picked,
                        message: String::new(),
                    });
                    self.emit(SessionEvent::Progress { completed, total });
                }
                ItemEnd::Failed(message) => {
                    failed += 1;
                    self.mark_item(&item.sha1, false);
                    self.emit(SessionEvent::ItemStatus {
                        index,
                        status: ItemStatus::Failed,
                        message: message.clone(),
                    });
                    self.emit(SessionEvent::Progress { completed, total });
                    return Ok(self.finish(false, false, message, picked, failed, started_at));
                }
                ItemEnd::Aborted(message) => {
                    self.emit(SessionEvent::ItemStatus {
                        index,
                        status: ItemStatus::Aborted,
                        message: message.clone(),
                    });
                    self.emit(SessionEvent::Progress { completed, total });
                    return Ok(self.finish_aborted_from(
                        index + 1,
                        &items,
                        completed,
                        picked,
                        failed,
                        started_at,
                        &message,
                    ));
                }
            }
        }
        Ok(self.finish(true, false, "", picked, failed, started_at))
    }

    // ---- per-item flow ----

    async fn run_item(&self, index: usize, item: &PickItem, step: &ActiveStep) -> ItemEnd {
        if item.sha1 == LOCAL_UNCOMMITTED_SHA1 || item.sha1 == LOCAL_COMMITTED_SHA1 {
            return self.apply_local_changes(item, step).await;
        }

        let out = {
            let git = self.git.clone();
            let repo = step.target.clone();
            let shas = vec![item.sha1.clone()];
            let record = self.options.record_origin;
            match self
                .tasks
                .call(move || git.cherry_pick(&repo, &shas, record))
                .await
            {
                Ok(out) => out,
                Err(e) => return ItemEnd::Failed(e.to_string()),
            }
        };
        if out.success() {
            return ItemEnd::Picked;
        }

        let picking = match self
            .operation_in_progress(ResolveOperation::CherryPick, &step.target)
            .await
        {
            Ok(picking) => picking,
            Err(message) => return ItemEnd::Failed(message),
        };
        if !picking
            && out.stderr.contains(BAD_OBJECT)
            && self.options.allow_patch_pick
            && step.source.is_some()
        {
            return self.patch_pick(index, item, step).await;
        }
        if picking {
            if self.abort_requested() {
                return self
                    .abort_operation(ResolveOperation::CherryPick, &step.target)
                    .await;
            }
            self.emit(SessionEvent::ItemStatus {
                index,
                status: ItemStatus::NeedsResolution,
                message: String::new(),
            });
            return self
                .conflict_phase(
                    index,
                    item,
                    step,
                    ResolveOperation::CherryPick,
                    out.error_text(),
                )
                .await;
        }
        ItemEnd::Failed(out.error_text())
    }

    async fn apply_local_changes(&self, item: &PickItem, step: &ActiveStep) -> ItemEnd {
        let Some(applier) = &self.applier else {
            return ItemEnd::Failed("no local-changes applier configured".to_string());
        };
        self.emit(SessionEvent::StatusText("applying local changes".to_string()));
        match applier
            .apply(&step.target, &item.sha1, step.source.as_deref())
            .await
        {
            Ok(true) => ItemEnd::Picked,
            Ok(false) => ItemEnd::Failed("local changes were not applied".to_string()),
            Err(e) => ItemEnd::Failed(format!("applying local changes failed: {e}")),
        }
    }

    /// The commit object is missing locally: generate the patch in the
    /// source repo and apply it with `git am` in the target.
    async fn patch_pick(&self, index: usize, item: &PickItem, step: &ActiveStep) -> ItemEnd {
        let source = match &step.source {
            Some(source) => source.clone(),
            None => return ItemEnd::Failed("no source repository for patch apply".to_string()),
        };
        self.emit(SessionEvent::StatusText(format!(
            "{} not present locally; applying as patch",
            short_sha(&item.sha1)
        )));

        let patch = {
            let git = self.git.clone();
            let sha1 = item.sha1.clone();
            match self
                .tasks
                .call(move || git.format_patch_stdout(&source, &sha1))
                .await
            {
                Ok(out) if out.success() => out.stdout,
                Ok(out) => {
                    return ItemEnd::Failed(format!(
                        "patch generation failed: {}",
                        out.error_text()
                    ))
                }
                Err(e) => return ItemEnd::Failed(e.to_string()),
            }
        };

        // The temp file is removed on every exit path below.
        let temp = match self.tasks.call(move || write_patch_file(patch)).await {
            Ok(temp) => temp,
            Err(e) => return ItemEnd::Failed(e.to_string()),
        };
        let out = {
            let git = self.git.clone();
            let repo = step.target.clone();
            let path = temp.path().to_path_buf();
            match self.tasks.call(move || git.am_apply(&repo, &path)).await {
                Ok(out) => out,
                Err(e) => return ItemEnd::Failed(e.to_string()),
            }
        };
        drop(temp);

        if out.success() {
            return ItemEnd::Picked;
        }
        let applying = match self
            .operation_in_progress(ResolveOperation::Am, &step.target)
            .await
        {
            Ok(applying) => applying,
            Err(message) => return ItemEnd::Failed(message),
        };
        if applying {
            if self.abort_requested() {
                return self
                    .abort_operation(ResolveOperation::Am, &step.target)
                    .await;
            }
            self.emit(SessionEvent::ItemStatus {
                index,
                status: ItemStatus::NeedsResolution,
                message: String::new(),
            });
            return self
                .conflict_phase(index, item, step, ResolveOperation::Am, out.error_text())
                .await;
        }
        ItemEnd::Failed(out.error_text())
    }

    /// Hand the conflicts to the panel and drive its events until the item
    /// ends. Stalls in `NeedsResolution` while the user retries.
    async fn conflict_phase(
        &self,
        index: usize,
        item: &PickItem,
        step: &ActiveStep,
        operation: ResolveOperation,
        initial_error: String,
    ) -> ItemEnd {
        let files = match self.conflict_files(&step.target).await {
            Ok(files) => files,
            Err(message) => return ItemEnd::Failed(message),
        };
        self.panel.prepare(PanelContext {
            repo_dir: step.target.clone(),
            operation,
            sha1: item.sha1.clone(),
            initial_error: Some(initial_error),
            extra_context: None,
        });
        self.panel.set_conflict_files(files.clone());
        let mut events = self.panel.subscribe();
        self.emit(SessionEvent::ConflictsDetected { operation, files });
        // An abort that landed before the subscription above would have
        // emitted its safe-point event into the void. The queue has not
        // started yet, so the repository is quiescent and aborting here is
        // safe.
        if self.abort_requested() {
            return self.abort_operation(operation, &step.target).await;
        }
        self.panel.start_resolve_all();

        // A non-resolved file outcome parks here until the user retries
        // (signalled by the next file actually starting).
        let mut latched: Option<String> = None;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session lagged behind panel events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return ItemEnd::Failed("panel event stream closed".to_string());
                }
            };
            match event {
                PanelEvent::FileOutcome { outcome, .. } if !outcome.is_resolved() => {
                    latched = Some(
                        outcome
                            .message
                            .unwrap_or_else(|| "conflict resolution failed".to_string()),
                    );
                }
                PanelEvent::CurrentFileChanged(Some(_)) => latched = None,
                PanelEvent::CurrentFileChanged(None) => {
                    if self.abort_requested() {
                        // AbortSafePointReached follows; handled below.
                    } else if let Some(message) = latched.clone() {
                        self.emit(SessionEvent::ItemStatus {
                            index,
                            status: ItemStatus::NeedsResolution,
                            message,
                        });
                    } else {
                        self.panel.start_finalize();
                    }
                }
                PanelEvent::FinalizeOutcome(outcome) => match outcome.status {
                    OutcomeStatus::Resolved => {
                        match self.remaining_conflicts(operation, &step.target).await {
                            // Renames and multi-stage merges can surface new
                            // conflicts after a successful continue.
                            Ok(Some(files)) => {
                                debug!(count = files.len(), "conflicts remain after finalize");
                                self.panel.set_conflict_files(files.clone());
                                self.emit(SessionEvent::ConflictsDetected { operation, files });
                                self.panel.start_resolve_all();
                            }
                            Ok(None) => return ItemEnd::Picked,
                            Err(message) => return ItemEnd::Failed(message),
                        }
                    }
                    OutcomeStatus::Aborted => {
                        return ItemEnd::Aborted(
                            outcome
                                .message
                                .unwrap_or_else(|| "operation aborted".to_string()),
                        );
                    }
                    OutcomeStatus::NeedsUser => {
                        self.emit(SessionEvent::ItemStatus {
                            index,
                            status: ItemStatus::NeedsResolution,
                            message: outcome
                                .message
                                .unwrap_or_else(|| "finalize requires attention".to_string()),
                        });
                    }
                    OutcomeStatus::Failed => {
                        return ItemEnd::Failed(
                            outcome
                                .message
                                .unwrap_or_else(|| "conflict resolution failed".to_string()),
                        );
                    }
                },
                PanelEvent::AbortSafePointReached => {
                    if self.abort_requested() {
                        return self.abort_operation(operation, &step.target).await;
                    }
                }
                _ => {}
            }
        }
    }

    // ---- helpers ----

    fn active_step(&self, item: &PickItem) -> ActiveStep {
        match &item.repo_dir {
            Some(rel) => ActiveStep {
                target: self.target_base.join(rel),
                source: self.source_base.as_ref().map(|s| s.join(rel)),
            },
            None => ActiveStep {
                target: self.target_base.clone(),
                source: self.source_base.clone(),
            },
        }
    }

    fn abort_requested(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    async fn conflict_files(&self, repo: &Path) -> Result<Vec<String>, String> {
        let git = self.git.clone();
        let repo = repo.to_path_buf();
        self.tasks
            .call(move || git.conflict_files(&repo))
            .await
            .map_err(|e| e.to_string())
    }

    async fn operation_in_progress(
        &self,
        operation: ResolveOperation,
        repo: &Path,
    ) -> Result<bool, String> {
        let git = self.git.clone();
        let repo = repo.to_path_buf();
        let result = match operation {
            ResolveOperation::CherryPick => {
                self.tasks.call(move || git.is_cherry_picking(&repo)).await
            }
            ResolveOperation::Am => self.tasks.call(move || git.is_applying(&repo)).await,
            ResolveOperation::Merge => return Ok(false),
        };
        result.map_err(|e| e.to_string())
    }

    /// `Some(files)` when the operation is still in progress with unmerged
    /// paths left, `None` when the item is fully applied.
    async fn remaining_conflicts(
        &self,
        operation: ResolveOperation,
        repo: &Path,
    ) -> Result<Option<Vec<String>>, String> {
        if !self.operation_in_progress(operation, repo).await? {
            return Ok(None);
        }
        let files = self.conflict_files(repo).await?;
        if files.is_empty() {
            Ok(None)
        } else {
            Ok(Some(files))
        }
    }

    /// Clean up the in-progress operation (best effort) and end the item.
    async fn abort_operation(&self, operation: ResolveOperation, repo: &Path) -> ItemEnd {
        let aborted = ItemEnd::Aborted("session aborted".to_string());
        let in_progress = match self.operation_in_progress(operation, repo).await {
            Ok(in_progress) => in_progress,
            Err(e) => {
                warn!(error = %e, "could not probe operation state during abort");
                false
            }
        };
        if in_progress {
            let git = self.git.clone();
            let repo_buf = repo.to_path_buf();
            let result = match operation {
                ResolveOperation::CherryPick => {
                    self.tasks
                        .call(move || git.cherry_pick_abort(&repo_buf))
                        .await
                }
                ResolveOperation::Am => self.tasks.call(move || git.am_abort(&repo_buf)).await,
                ResolveOperation::Merge => return aborted,
            };
            match result {
                Ok(out) if out.success() => {
                    info!(operation = %operation, "in-progress operation aborted")
                }
                Ok(out) => warn!(
                    operation = %operation,
                    stderr = %out.stderr.trim(),
                    "operation abort reported an error"
                ),
                Err(e) => warn!(operation = %operation, error = %e, "operation abort failed"),
            }
        }
        aborted
    }

    fn mark_item(&self, sha1: &str, ok: bool) {
        if let Some(marker) = &self.marker {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| marker.mark(sha1, ok)));
            if result.is_err() {
                warn!(sha1, "pick marker panicked");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Mark every item from `next_index` on as aborted, then finish.
    fn finish_aborted_from(
        &self,
        next_index: usize,
        items: &[PickItem],
        mut completed: usize,
        picked: usize,
        failed: usize,
        started_at: DateTime<Utc>,
        message: &str,
    ) -> SessionSummary {
        for index in next_index..items.len() {
            self.emit(SessionEvent::ItemStatus {
                index,
                status: ItemStatus::Aborted,
                message: "session aborted".to_string(),
            });
            completed += 1;
        }
        if next_index < items.len() {
            self.emit(SessionEvent::Progress {
                completed,
                total: items.len(),
            });
        }
        self.finish(false, true, message, picked, failed, started_at)
    }

    fn finish(
        &self,
        ok: bool,
        aborted: bool,
        message: impl Into<String>,
        picked: usize,
        failed: usize,
        started_at: DateTime<Utc>,
    ) -> SessionSummary {
        let summary = SessionSummary {
            ok,
            aborted,
            need_reload: picked > 0,
            message: message.into(),
            picked,
            failed,
            started_at,
            finished_at: Utc::now(),
        };
        if !self.finished.swap(true, Ordering::SeqCst) {
            info!(
                ok = summary.ok,
                aborted = summary.aborted,
                picked = summary.picked,
                failed = summary.failed,
                "session finished"
            );
            self.emit(SessionEvent::Finished(summary.clone()));
        }
        summary
    }
}

fn write_patch_file(patch: String) -> std::io::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(patch.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn short_sha(sha1: &str) -> &str {
    sha1.get(..7).unwrap_or(sha1)
}
