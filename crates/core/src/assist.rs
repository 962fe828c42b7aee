//! Assisted-resolution service boundary.
//!
//! The desktop shell owns the actual model transport; the core only knows
//! this trait. Implementations rewrite a conflicted file in place so it no
//! longer contains conflict markers, then return; staging and verification
//! stay on the core side.

use std::path::PathBuf;

use async_trait::async_trait;

/// One assisted-resolution request.
#[derive(Debug, Clone)]
pub struct AssistRequest {
    /// Repository the conflicted file lives in.
    pub repo_dir: PathBuf,
    /// Commit being applied when the conflict arose.
    pub sha1: String,
    /// Conflicted path, relative to `repo_dir`.
    pub path: String,
    /// Preformatted conflict regions with surrounding context.
    pub conflict_excerpt: String,
    /// Extra caller-supplied context (commit subject, ticket text, ...).
    pub extra_context: Option<String>,
    /// Where the service may append its run report. Opaque to the core.
    pub report_file: Option<PathBuf>,
}

/// Assisted conflict resolution service.
///
/// An `Err` from [`resolve_file`](Assistant::resolve_file) is not fatal to
/// the pipeline; the calling handler passes and the next resolver gets its
/// turn.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn resolve_file(&self, request: AssistRequest) -> anyhow::Result<()>;
}
