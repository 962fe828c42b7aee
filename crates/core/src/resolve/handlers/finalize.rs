//! Finalize handlers: continue the surrounding operation once every
//! conflicted file has been staged.

use async_trait::async_trait;
use tracing::{info, warn};

use super::next_prompt_id;
use crate::resolve::events::{PromptKind, ResolveOutcome, ResolvePrompt};
use crate::resolve::{HandlerVerdict, ResolveContext, ResolveOperation, ResolveServices};

/// Answer tokens for the empty-commit prompt.
pub const EMPTY_COMMIT_SKIP: &str = "skip";
pub const EMPTY_COMMIT_ALLOW: &str = "allow-empty";
pub const EMPTY_COMMIT_ABORT: &str = "abort";

/// Phrase git prints when continuing would create an empty commit.
const EMPTY_COMMIT_HINT: &str = "git commit --allow-empty";

/// Concludes a cherry-pick step with `git cherry-pick --continue`.
///
/// When the pick became empty after resolution, git refuses to continue and
/// suggests `--allow-empty`; the user then chooses between skipping the
/// commit, keeping it empty, or aborting the whole cherry-pick.
#[derive(Debug, Default)]
pub struct CherryPickFinalizeHandler;

impl CherryPickFinalizeHandler {
    pub fn new() -> Self {
        Self
    }

    async fn empty_commit_flow(
        &self,
        ctx: &ResolveContext,
        services: &ResolveServices,
    ) -> HandlerVerdict {
        let prompt = ResolvePrompt {
            id: next_prompt_id(),
            kind: PromptKind::EmptyCommitChoice,
            title: "Empty commit".to_string(),
            text: format!(
                "Cherry-picking {} produced an empty commit. Skip it, keep it empty, or abort the cherry-pick?",
                short_sha(&ctx.sha1)
            ),
            options: vec![
                EMPTY_COMMIT_SKIP.to_string(),
                EMPTY_COMMIT_ALLOW.to_string(),
                EMPTY_COMMIT_ABORT.to_string(),
            ],
        };

        let choice = match services.prompts.ask(prompt).await {
            Some(choice) => choice,
            None => {
                return HandlerVerdict::Handled(ResolveOutcome::aborted(
                    "cancelled while awaiting empty-commit choice",
                ))
            }
        };

        let git = services.git.clone();
        let repo = ctx.repo_dir.clone();
        match choice.as_str() {
            EMPTY_COMMIT_SKIP => {
                let result = services
                    .tasks
                    .call(move || git.cherry_pick_skip(&repo))
                    .await;
                match result {
                    Ok(out) if out.success() => {
                        info!(sha1 = %ctx.sha1, "empty commit skipped");
                        HandlerVerdict::Handled(ResolveOutcome::resolved_with(
                            "empty commit skipped",
                        ))
                    }
                    Ok(out) => HandlerVerdict::Handled(ResolveOutcome::failed(out.error_text())),
                    Err(e) => HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
                }
            }
            EMPTY_COMMIT_ALLOW => {
                let result = services
                    .tasks
                    .call(move || git.cherry_pick_allow_empty(&repo))
                    .await;
                match result {
                    Ok(out) if out.success() => {
                        info!(sha1 = %ctx.sha1, "empty commit kept");
                        HandlerVerdict::Handled(ResolveOutcome::resolved_with("empty commit kept"))
                    }
                    Ok(out) => HandlerVerdict::Handled(ResolveOutcome::failed(out.error_text())),
                    Err(e) => HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
                }
            }
            EMPTY_COMMIT_ABORT => {
                let result = services
                    .tasks
                    .call(move || git.cherry_pick_abort(&repo))
                    .await;
                match result {
                    Ok(out) if out.success() => {
                        HandlerVerdict::Handled(ResolveOutcome::aborted("cherry-pick aborted"))
                    }
                    Ok(out) => HandlerVerdict::Handled(ResolveOutcome::failed(out.error_text())),
                    Err(e) => HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
                }
            }
            other => {
                warn!(choice = other, "unexpected empty-commit choice");
                HandlerVerdict::Handled(ResolveOutcome::failed(format!(
                    "unexpected empty-commit choice: {other}"
                )))
            }
        }
    }
}

#[async_trait]
impl crate::resolve::ResolveHandler for CherryPickFinalizeHandler {
    fn name(&self) -> &'static str {
        "cherry-pick-finalize"
    }

    async fn run(&mut self, ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict {
        if ctx.operation != ResolveOperation::CherryPick || ctx.path.is_some() {
            return HandlerVerdict::Pass;
        }

        services.step("continuing cherry-pick");
        let git = services.git.clone();
        let repo = ctx.repo_dir.clone();
        let result = services
            .tasks
            .call(move || git.cherry_pick_continue(&repo))
            .await;
        let out = match result {
            Ok(out) => out,
            Err(e) => return HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
        };

        if out.success() {
            return HandlerVerdict::Handled(ResolveOutcome::resolved_with("cherry-pick continued"));
        }
        if out.stderr.contains(EMPTY_COMMIT_HINT) || out.stdout.contains(EMPTY_COMMIT_HINT) {
            return self.empty_commit_flow(ctx, services).await;
        }
        HandlerVerdict::Handled(ResolveOutcome::needs_user(out.error_text()))
    }
}

/// Concludes a mailbox-apply step with `git am --continue`.
///
/// `git am` has no empty-commit refusal of its own, so any failure to
/// continue is handed back to the user as-is.
#[derive(Debug, Default)]
pub struct AmFinalizeHandler;

impl AmFinalizeHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl crate::resolve::ResolveHandler for AmFinalizeHandler {
    fn name(&self) -> &'static str {
        "am-finalize"
    }

    async fn run(&mut self, ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict {
        if ctx.operation != ResolveOperation::Am || ctx.path.is_some() {
            return HandlerVerdict::Pass;
        }

        services.step("continuing mailbox apply");
        let git = services.git.clone();
        let repo = ctx.repo_dir.clone();
        let result = services.tasks.call(move || git.am_continue(&repo)).await;
        match result {
            Ok(out) if out.success() => {
                HandlerVerdict::Handled(ResolveOutcome::resolved_with("mailbox apply continued"))
            }
            Ok(out) => HandlerVerdict::Handled(ResolveOutcome::needs_user(out.error_text())),
            Err(e) => HandlerVerdict::Handled(ResolveOutcome::failed(e.to_string())),
        }
    }
}

fn short_sha(sha1: &str) -> &str {
    sha1.get(..7).unwrap_or(sha1)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::git::GitClient;
    use crate::resolve::events::OutcomeStatus;
    use crate::resolve::prompts::PromptGate;
    use crate::resolve::{CancelFlag, EventSink, ResolveHandler};
    use crate::tasks::TaskRunner;

    fn services() -> ResolveServices {
        let sink: EventSink = Arc::new(|_| {});
        let gate = PromptGate::new();
        ResolveServices {
            tasks: TaskRunner::new(),
            git: GitClient::new(),
            assistant: None,
            prompts: gate.sink(Arc::clone(&sink)),
            cancel: CancelFlag::new(),
            events: sink,
        }
    }

    fn finalize_ctx(operation: ResolveOperation, repo_dir: PathBuf) -> ResolveContext {
        ResolveContext {
            repo_dir,
            operation,
            sha1: "1234567890123456789012345678901234567890".to_string(),
            path: None,
            initial_error: None,
            mergetool: None,
            extra_context: None,
        }
    }

    #[tokio::test]
    async fn cherry_pick_finalize_passes_on_other_operations() {
        let mut handler = CherryPickFinalizeHandler::new();
        let ctx = finalize_ctx(ResolveOperation::Am, PathBuf::from("/nonexistent"));
        assert!(matches!(
            handler.run(&ctx, &services()).await,
            HandlerVerdict::Pass
        ));
    }

    #[tokio::test]
    async fn cherry_pick_finalize_passes_on_file_steps() {
        let mut handler = CherryPickFinalizeHandler::new();
        let mut ctx = finalize_ctx(ResolveOperation::CherryPick, PathBuf::from("/nonexistent"));
        ctx.path = Some("src/main.rs".to_string());
        assert!(matches!(
            handler.run(&ctx, &services()).await,
            HandlerVerdict::Pass
        ));
    }

    #[tokio::test]
    async fn am_finalize_passes_on_cherry_pick() {
        let mut handler = AmFinalizeHandler::new();
        let ctx = finalize_ctx(ResolveOperation::CherryPick, PathBuf::from("/nonexistent"));
        assert!(matches!(
            handler.run(&ctx, &services()).await,
            HandlerVerdict::Pass
        ));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn continue_outside_a_repo_needs_user() {
        if !git_available() {
            eprintln!("SKIPPED: git not found in PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut handler = CherryPickFinalizeHandler::new();
        let ctx = finalize_ctx(ResolveOperation::CherryPick, dir.path().to_path_buf());
        match handler.run(&ctx, &services()).await {
            HandlerVerdict::Handled(outcome) => {
                assert_eq!(outcome.status, OutcomeStatus::NeedsUser);
                assert!(outcome.message.is_some());
            }
            HandlerVerdict::Pass => panic!("expected a handled outcome"),
        }
    }

    #[test]
    fn short_sha_truncates_and_tolerates_short_input() {
        assert_eq!(short_sha("1234567890"), "1234567");
        assert_eq!(short_sha("abc"), "abc");
    }
}
