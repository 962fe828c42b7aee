//! Git operations for the Gitwing core.

pub mod client;

pub use client::{ConfigScope, ConflictStages, GitClient, GitOutput};
