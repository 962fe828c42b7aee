//! Gitwing core library.
//!
//! This crate provides the engine-side components of the Gitwing desktop
//! companion: configuration, the blocking-task bridge, the Git CLI client,
//! the pluggable conflict-resolution pipeline, and the cherry-pick session
//! runner that drives it all.

pub mod assist;
pub mod binary_detection;
pub mod config;
pub mod errors;
pub mod git;
pub mod resolve;
pub mod session;
pub mod tasks;

// Re-exports for convenience.
pub use config::CoreConfig;
pub use errors::CoreError;
pub use git::GitClient;
pub use resolve::ResolvePanel;
pub use session::CherryPickSession;
pub use tasks::TaskRunner;
