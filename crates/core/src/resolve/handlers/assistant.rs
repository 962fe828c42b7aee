//! Assistant handler: resolves a conflicted file without user interaction.
//!
//! Tries the cheap blob-identity shortcuts first, then hands a conflict
//! excerpt to the configured [`Assistant`](crate::assist::Assistant). Every
//! exit short of success is a pass so the merge tool gets its turn.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assist::AssistRequest;
use crate::binary_detection::is_binary_file;
use crate::git::ConflictStages;
use crate::resolve::events::{ResolveMethod, ResolveOutcome};
use crate::resolve::excerpt::build_excerpt;
use crate::resolve::{HandlerVerdict, ResolveContext, ResolveHandler, ResolveServices};

/// Non-interactive resolution: blob-identity shortcuts, then the assistant.
pub struct AssistantHandler {
    report_file: Option<PathBuf>,
}

impl AssistantHandler {
    pub fn new() -> Self {
        Self { report_file: None }
    }

    /// File the assistant should append its per-conflict report to.
    pub fn with_report_file(mut self, path: PathBuf) -> Self {
        self.report_file = Some(path);
        self
    }
}

impl Default for AssistantHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResolveHandler for AssistantHandler {
    fn name(&self) -> &'static str {
        "assistant"
    }

    async fn run(&mut self, ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict {
        let path = match &ctx.path {
            Some(path) => path.clone(),
            None => return HandlerVerdict::Pass,
        };
        let assistant = match &services.assistant {
            Some(assistant) => Arc::clone(assistant),
            None => return HandlerVerdict::Pass,
        };

        services.step(format!("checking trivial resolutions for {path}"));
        let stages = {
            let git = services.git.clone();
            let repo = ctx.repo_dir.clone();
            let p = path.clone();
            match services.tasks.call(move || git.conflict_stages(&repo, &p)).await {
                Ok(stages) => stages,
                Err(e) => {
                    debug!(path = %path, error = %e, "could not read conflict stages");
                    return HandlerVerdict::Pass;
                }
            }
        };
        if stages.is_empty() {
            return HandlerVerdict::Pass;
        }
        if stages.ours.is_none() || stages.theirs.is_none() {
            debug!(path = %path, "deleted conflict, leaving to the merge tool");
            return HandlerVerdict::Pass;
        }

        if let Some(take_ours) = trivial_side(&stages) {
            match checkout_side(services, ctx.repo_dir.clone(), path.clone(), take_ours).await {
                Ok(()) => {
                    services.file_resolved(path, ResolveMethod::Trivial);
                    return HandlerVerdict::Handled(ResolveOutcome::resolved_with(
                        "resolved by blob identity",
                    ));
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "trivial resolution failed");
                    return HandlerVerdict::Pass;
                }
            }
        }

        let content = {
            let abs = ctx.repo_dir.join(&path);
            match services.tasks.call(move || std::fs::read(&abs)).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(path = %path, error = %e, "could not read conflicted file");
                    return HandlerVerdict::Pass;
                }
            }
        };
        if is_binary_file(&path, &content) {
            debug!(path = %path, "binary file, leaving to the merge tool");
            return HandlerVerdict::Pass;
        }
        let text = String::from_utf8_lossy(&content);
        let excerpt = match build_excerpt(&path, &text) {
            Some(excerpt) => excerpt,
            None => {
                debug!(path = %path, "no conflict markers in working tree");
                return HandlerVerdict::Pass;
            }
        };

        services.step(format!("asking assistant to resolve {path}"));
        let request = AssistRequest {
            repo_dir: ctx.repo_dir.clone(),
            sha1: ctx.sha1.clone(),
            path: path.clone(),
            conflict_excerpt: excerpt,
            extra_context: ctx.extra_context.clone(),
            report_file: self.report_file.clone(),
        };
        let result = tokio::select! {
            result = assistant.resolve_file(request) => result,
            _ = services.cancel.cancelled() => {
                return HandlerVerdict::Handled(ResolveOutcome::aborted("resolution cancelled"));
            }
        };
        if let Err(e) = result {
            warn!(path = %path, error = %e, "assistant could not resolve file");
            return HandlerVerdict::Pass;
        }

        match stage_file(services, ctx.repo_dir.clone(), path.clone()).await {
            Ok(()) => {
                services.file_resolved(path, ResolveMethod::Assistant);
                HandlerVerdict::Handled(ResolveOutcome::resolved_with("resolved by assistant"))
            }
            Err(e) => {
                warn!(path = %path, error = %e, "staging assistant result failed");
                HandlerVerdict::Pass
            }
        }
    }
}

/// Which side settles the conflict without looking at content, if any.
/// `Some(true)` keeps ours, `Some(false)` takes theirs. Deleted conflicts
/// (a side missing entirely) are left for the merge tool.
fn trivial_side(stages: &ConflictStages) -> Option<bool> {
    let ours = stages.ours.as_deref()?;
    let theirs = stages.theirs.as_deref()?;
    if ours == theirs {
        return Some(true);
    }
    match stages.base.as_deref() {
        Some(base) if base == ours => Some(false),
        Some(base) if base == theirs => Some(true),
        _ => None,
    }
}

async fn checkout_side(
    services: &ResolveServices,
    repo: PathBuf,
    path: String,
    take_ours: bool,
) -> Result<(), String> {
    let checked_out = {
        let git = services.git.clone();
        let repo = repo.clone();
        let p = path.clone();
        services
            .tasks
            .call(move || git.resolve_with_side(&repo, &p, take_ours))
            .await
            .map_err(|e| e.to_string())?
    };
    if !checked_out {
        return Err(format!("checkout {} failed", if take_ours { "--ours" } else { "--theirs" }));
    }
    stage_file(services, repo, path).await
}

async fn stage_file(services: &ResolveServices, repo: PathBuf, path: String) -> Result<(), String> {
    let git = services.git.clone();
    let stderr = services
        .tasks
        .call(move || git.add_files(&repo, &[path]))
        .await
        .map_err(|e| e.to_string())?;
    if !stderr.is_empty() {
        return Err(stderr);
    }
    Ok(())
}
