//! Built-in resolve handlers.
//!
//! Three families: [`AssistantHandler`] fixes a conflicted file without user
//! interaction (blob-identity shortcuts, then the configured assistant),
//! [`MergetoolHandler`] drives `git mergetool` for one file and relays its
//! questions as prompts, and the finalize handlers continue the surrounding
//! operation once every file is staged.

mod assistant;
mod finalize;
mod mergetool;

pub use assistant::AssistantHandler;
pub use finalize::{
    AmFinalizeHandler, CherryPickFinalizeHandler, EMPTY_COMMIT_ABORT, EMPTY_COMMIT_ALLOW,
    EMPTY_COMMIT_SKIP,
};
pub use mergetool::{
    MergetoolHandler, CHOICE_ABORT, DELETED_USE_CREATED, DELETED_USE_DELETED, DELETED_USE_MODIFIED,
    RUN_TOOL_ABORT, RUN_TOOL_CONTINUE, SYMLINK_USE_LOCAL, SYMLINK_USE_REMOTE,
};

use std::sync::atomic::{AtomicU64, Ordering};

static PROMPT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for interactive prompts. Replies are matched by
/// id, so ids must never repeat across handlers or runs.
pub(crate) fn next_prompt_id() -> u64 {
    PROMPT_SEQ.fetch_add(1, Ordering::Relaxed)
}
