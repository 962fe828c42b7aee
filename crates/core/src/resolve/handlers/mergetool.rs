//! Merge-tool handler: drives `git mergetool` for one conflicted file.
//!
//! The child's stdout is scanned incrementally for the questions git asks on
//! the terminal. Yes/no bookkeeping questions are answered automatically;
//! deleted-file and symlink conflicts become prompts for the user, and the
//! chosen letter is written straight back to the child. Prompts arrive
//! without a trailing newline, so the scanner works on a growing buffer with
//! a watermark instead of whole lines.

use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

use super::next_prompt_id;
use crate::resolve::events::{PromptKind, ResolveMethod, ResolveOutcome, ResolvePrompt};
use crate::resolve::{HandlerVerdict, ResolveContext, ResolveHandler, ResolveServices};

/// Answer tokens for [`PromptKind::DeletedConflictChoice`].
pub const DELETED_USE_CREATED: &str = "c";
pub const DELETED_USE_MODIFIED: &str = "m";
pub const DELETED_USE_DELETED: &str = "d";

/// Answer tokens for [`PromptKind::SymlinkConflictChoice`].
pub const SYMLINK_USE_LOCAL: &str = "l";
pub const SYMLINK_USE_REMOTE: &str = "r";

/// Abort token accepted by both conflict-choice prompts. Written to the
/// child, which then aborts the mergetool run itself.
pub const CHOICE_ABORT: &str = "a";

/// Answer tokens for [`PromptKind::RunMergetoolConfirm`].
pub const RUN_TOOL_CONTINUE: &str = "continue";
pub const RUN_TOOL_ABORT: &str = "abort";

const ANSWER_NO: &str = "n";

// Phrases `git mergetool` prints, with LANGUAGE=en_US pinning the locale.
const CONTINUE_MERGING: &str = "Continue merging other unresolved paths [y/n]?";
const MERGE_SUCCESSFUL: &str = "Was the merge successful [y/n]?";
const HIT_RETURN: &str = "Hit return to start merge resolution tool";
const DELETED_CONFLICT: &str = "Deleted merge conflict for";
const SYMLINK_CONFLICT: &str = "Symbolic link merge conflict";

static DELETED_PATH_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"Deleted merge conflict for '([^']+)'").ok());

/// Interactive resolution through `git mergetool`.
#[derive(Debug, Default)]
pub struct MergetoolHandler;

impl MergetoolHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResolveHandler for MergetoolHandler {
    fn name(&self) -> &'static str {
        "mergetool"
    }

    async fn run(&mut self, ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict {
        let path = match &ctx.path {
            Some(path) => path.clone(),
            None => return HandlerVerdict::Pass,
        };

        // A prior handler may have already fixed the file. Re-running the
        // tool would report "no files need merging" and claim a resolution
        // it never made.
        let stages = {
            let git = services.git.clone();
            let repo = ctx.repo_dir.clone();
            let p = path.clone();
            match services.tasks.call(move || git.conflict_stages(&repo, &p)).await {
                Ok(stages) => stages,
                Err(e) => return HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
            }
        };
        if stages.is_empty() {
            debug!(path = %path, "file no longer unmerged, skipping merge tool");
            return HandlerVerdict::Pass;
        }

        services.step(format!("running merge tool for {path}"));
        let mut cmd = Command::new("git");
        cmd.arg("mergetool");
        if let Some(tool) = &ctx.mergetool {
            cmd.arg(format!("--tool={tool}"));
        }
        cmd.arg("--")
            .arg(&path)
            .current_dir(&ctx.repo_dir)
            .env("LANGUAGE", "en_US")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HandlerVerdict::Handled(ResolveOutcome::failed(format!(
                    "failed to launch git mergetool: {e}"
                )))
            }
        };
        let mut stdin = child.stdin.take();
        let mut stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill().await;
                return HandlerVerdict::Handled(ResolveOutcome::failed(
                    "git mergetool stdout was not captured",
                ));
            }
        };
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut scanner = PromptScanner::new();
        let mut user_abort: Option<String> = None;
        let mut read_buf = [0u8; 4096];
        loop {
            tokio::select! {
                read = stdout.read(&mut read_buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "merge tool stdout closed");
                            break;
                        }
                    };
                    scanner.push(&read_buf[..n]);
                    while let Some(action) = scanner.scan() {
                        match handle_action(action, &path, services, &mut stdin, &mut user_abort)
                            .await
                        {
                            Flow::Continue => {}
                            Flow::Abort(message) => {
                                let _ = child.kill().await;
                                return HandlerVerdict::Handled(ResolveOutcome::aborted(message));
                            }
                        }
                    }
                }
                _ = services.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return HandlerVerdict::Handled(ResolveOutcome::aborted("merge tool cancelled"));
                }
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                return HandlerVerdict::Handled(ResolveOutcome::failed(format!(
                    "git mergetool: {e}"
                )))
            }
        };
        if status.success() {
            services.file_resolved(path, ResolveMethod::MergeTool);
            return HandlerVerdict::Handled(ResolveOutcome::resolved_with("merge tool completed"));
        }
        if let Some(message) = user_abort {
            return HandlerVerdict::Handled(ResolveOutcome::aborted(message));
        }
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let stderr_text = String::from_utf8_lossy(&stderr_bytes);
        let stderr_text = stderr_text.trim();
        let message = if stderr_text.is_empty() {
            format!(
                "git mergetool exited with status {}",
                status.code().unwrap_or(-1)
            )
        } else {
            stderr_text.to_string()
        };
        HandlerVerdict::Handled(ResolveOutcome::failed(message))
    }
}

// ---------------------------------------------------------------------------
// Action handling
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Abort(String),
}

async fn handle_action(
    action: ScanAction,
    path: &str,
    services: &ResolveServices,
    stdin: &mut Option<ChildStdin>,
    user_abort: &mut Option<String>,
) -> Flow {
    match action {
        ScanAction::Auto(answer) => {
            debug!(path = %path, answer, "auto-answering merge tool question");
            write_answer(stdin, answer).await;
            Flow::Continue
        }
        ScanAction::RunToolConfirm => {
            let prompt = ResolvePrompt {
                id: next_prompt_id(),
                kind: PromptKind::RunMergetoolConfirm,
                title: "Merge tool".to_string(),
                text: format!("Launch the merge tool for {path}?"),
                options: vec![RUN_TOOL_CONTINUE.to_string(), RUN_TOOL_ABORT.to_string()],
            };
            match services.prompts.ask(prompt).await {
                Some(choice) if choice == RUN_TOOL_CONTINUE => {
                    write_answer(stdin, "").await;
                    Flow::Continue
                }
                Some(_) => Flow::Abort("merge tool launch declined".to_string()),
                None => Flow::Abort("cancelled while awaiting merge tool launch".to_string()),
            }
        }
        ScanAction::Deleted {
            block,
            path: deleted_path,
            mentions_created,
        } => {
            let keep = if mentions_created {
                DELETED_USE_CREATED
            } else {
                DELETED_USE_MODIFIED
            };
            let prompt = ResolvePrompt {
                id: next_prompt_id(),
                kind: PromptKind::DeletedConflictChoice,
                title: format!(
                    "Deleted file conflict: {}",
                    deleted_path.as_deref().unwrap_or(path)
                ),
                text: block,
                options: vec![
                    keep.to_string(),
                    DELETED_USE_DELETED.to_string(),
                    CHOICE_ABORT.to_string(),
                ],
            };
            match services.prompts.ask(prompt).await {
                Some(choice) => {
                    if choice == CHOICE_ABORT {
                        *user_abort = Some("deleted-file conflict aborted".to_string());
                    }
                    write_answer(stdin, &choice).await;
                    Flow::Continue
                }
                None => Flow::Abort("cancelled while awaiting deleted-conflict choice".to_string()),
            }
        }
        ScanAction::Symlink { block } => {
            let prompt = ResolvePrompt {
                id: next_prompt_id(),
                kind: PromptKind::SymlinkConflictChoice,
                title: format!("Symbolic link conflict: {path}"),
                text: block,
                options: vec![
                    SYMLINK_USE_LOCAL.to_string(),
                    SYMLINK_USE_REMOTE.to_string(),
                    CHOICE_ABORT.to_string(),
                ],
            };
            match services.prompts.ask(prompt).await {
                Some(choice) => {
                    if choice == CHOICE_ABORT {
                        *user_abort = Some("symlink conflict aborted".to_string());
                    }
                    write_answer(stdin, &choice).await;
                    Flow::Continue
                }
                None => Flow::Abort("cancelled while awaiting symlink-conflict choice".to_string()),
            }
        }
    }
}

async fn write_answer(stdin: &mut Option<ChildStdin>, answer: &str) {
    if let Some(stdin) = stdin.as_mut() {
        let line = format!("{answer}\n");
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "could not write answer to merge tool");
        } else {
            let _ = stdin.flush().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt scanning
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum ScanAction {
    /// Write this answer to the child without asking anyone.
    Auto(&'static str),
    /// Ask which side of a deleted-file conflict wins.
    Deleted {
        block: String,
        path: Option<String>,
        mentions_created: bool,
    },
    /// Ask which side of a symlink conflict wins.
    Symlink { block: String },
    /// Ask whether to launch the visual tool.
    RunToolConfirm,
}

#[derive(Clone, Copy)]
enum Hit {
    Auto(&'static str),
    RunTool,
    Deleted,
    Symlink,
}

/// Growing stdout buffer with an answered-offset watermark. Everything
/// before the watermark has already produced an action and is never matched
/// again.
struct PromptScanner {
    buffer: String,
    answered: usize,
}

impl PromptScanner {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            answered: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        // Lossy is fine: every matched phrase is ASCII.
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Next action in the unanswered region, or `None` when nothing (or
    /// only an incomplete block) is pending. Earliest match wins so answers
    /// stay in the order the child asked.
    fn scan(&mut self) -> Option<ScanAction> {
        let pending = &self.buffer[self.answered..];
        let candidates = [
            (
                pending.find(CONTINUE_MERGING),
                Hit::Auto(ANSWER_NO),
                CONTINUE_MERGING.len(),
            ),
            (
                pending.find(MERGE_SUCCESSFUL),
                Hit::Auto(ANSWER_NO),
                MERGE_SUCCESSFUL.len(),
            ),
            (pending.find(HIT_RETURN), Hit::RunTool, HIT_RETURN.len()),
            (
                pending.find(DELETED_CONFLICT),
                Hit::Deleted,
                DELETED_CONFLICT.len(),
            ),
            (
                pending.find(SYMLINK_CONFLICT),
                Hit::Symlink,
                SYMLINK_CONFLICT.len(),
            ),
        ];
        let (pos, hit, pat_len) = candidates
            .into_iter()
            .filter_map(|(pos, hit, len)| pos.map(|p| (p, hit, len)))
            .min_by_key(|(p, _, _)| *p)?;

        match hit {
            Hit::Auto(answer) => {
                self.answered += pos + pat_len;
                Some(ScanAction::Auto(answer))
            }
            Hit::RunTool => {
                self.answered += pos + pat_len;
                Some(ScanAction::RunToolConfirm)
            }
            Hit::Deleted => {
                let block = self.take_block(pos)?;
                let path = DELETED_PATH_RE
                    .as_ref()
                    .and_then(|re| re.captures(&block))
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string());
                let mentions_created = block.contains("(c)reated");
                Some(ScanAction::Deleted {
                    block,
                    path,
                    mentions_created,
                })
            }
            Hit::Symlink => {
                let block = self.take_block(pos)?;
                Some(ScanAction::Symlink { block })
            }
        }
    }

    /// Consume the block starting at `pos` (relative to the watermark) up
    /// to and including its closing `?`. `None` while the `?` has not
    /// arrived yet; the watermark then stays put so the block is retried.
    fn take_block(&mut self, pos: usize) -> Option<String> {
        let after = &self.buffer[self.answered + pos..];
        let qpos = after.find('?')?;
        let block = after[..=qpos].trim().to_string();
        self.answered += pos + qpos + 1;
        Some(block)
    }
}
