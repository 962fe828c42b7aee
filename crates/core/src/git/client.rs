//! Synchronous Git CLI client.
//!
//! Every operation shells out to `git` and reports the exit code, stdout,
//! and stderr as data; deciding what a non-zero exit means (conflict, retry,
//! abort) is the caller's job. Methods block, so resolution flows invoke
//! them through [`crate::tasks::TaskRunner`] rather than on the async
//! runtime directly.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, instrument};

use crate::errors::GitError;

/// Captured result of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Human-readable failure text: trimmed stderr, or the exit status when
    /// the command printed nothing.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("git exited with status {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Which config store [`GitClient::config_value`] consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// The merged view git itself would use.
    Effective,
    Local,
    Global,
}

/// Blob ids of the index stages of an unmerged path. A missing side means
/// that stage is absent (e.g. a delete/modify conflict has no `ours` or no
/// `theirs`; an add/add conflict has no `base`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictStages {
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

impl ConflictStages {
    pub fn is_empty(&self) -> bool {
        self.base.is_none() && self.ours.is_none() && self.theirs.is_none()
    }
}

/// Synchronous client for the local `git` CLI.
#[derive(Debug, Clone)]
pub struct GitClient {
    program: PathBuf,
}

impl Default for GitClient {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitClient {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- sequencing commands ----

    /// `git cherry-pick [-x] <shas...>`.
    #[instrument(skip(self, shas), fields(repo = %repo_dir.display(), count = shas.len()))]
    pub fn cherry_pick(
        &self,
        repo_dir: &Path,
        shas: &[String],
        record_origin: bool,
    ) -> Result<GitOutput, GitError> {
        let mut args = vec!["cherry-pick"];
        if record_origin {
            args.push("-x");
        }
        args.extend(shas.iter().map(String::as_str));
        self.run(Some(repo_dir), &args)
    }

    /// `git cherry-pick --continue` with the editor disabled.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn cherry_pick_continue(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        self.run(
            Some(repo_dir),
            &["-c", "core.editor=true", "cherry-pick", "--continue"],
        )
    }

    /// `git cherry-pick --skip`.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn cherry_pick_skip(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        self.run(Some(repo_dir), &["cherry-pick", "--skip"])
    }

    /// Commit the staged (possibly empty) result, then continue the
    /// sequence when one is still in progress. Returns the output of the
    /// last command run.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn cherry_pick_allow_empty(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        let commit = self.run(Some(repo_dir), &["commit", "--allow-empty", "--no-edit"])?;
        if !commit.success() {
            return Ok(commit);
        }
        if self.is_cherry_picking(repo_dir)? {
            return self.cherry_pick_continue(repo_dir);
        }
        Ok(commit)
    }

    /// `git cherry-pick --abort`.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn cherry_pick_abort(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        self.run(Some(repo_dir), &["cherry-pick", "--abort"])
    }

    /// `git am --continue` with the editor disabled.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn am_continue(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        self.run(
            Some(repo_dir),
            &["-c", "core.editor=true", "am", "--continue"],
        )
    }

    /// `git am --abort`.
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn am_abort(&self, repo_dir: &Path) -> Result<GitOutput, GitError> {
        self.run(Some(repo_dir), &["am", "--abort"])
    }

    /// Apply a mailbox patch with `git am --3way --ignore-space-change`.
    #[instrument(skip(self), fields(repo = %repo_dir.display(), patch = %patch.display()))]
    pub fn am_apply(&self, repo_dir: &Path, patch: &Path) -> Result<GitOutput, GitError> {
        let patch_str = patch.to_string_lossy().to_string();
        self.run(
            Some(repo_dir),
            &["am", "--3way", "--ignore-space-change", &patch_str],
        )
    }

    /// `git format-patch -1 --stdout <sha>`; the patch text is in stdout.
    #[instrument(skip(self), fields(repo = %repo_dir.display(), sha1))]
    pub fn format_patch_stdout(&self, repo_dir: &Path, sha1: &str) -> Result<GitOutput, GitError> {
        self.run(Some(repo_dir), &["format-patch", "-1", "--stdout", sha1])
    }

    // ---- state probes ----

    /// Whether a cherry-pick is in progress (CHERRY_PICK_HEAD exists).
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn is_cherry_picking(&self, repo_dir: &Path) -> Result<bool, GitError> {
        self.git_path_exists(repo_dir, "CHERRY_PICK_HEAD")
    }

    /// Whether a `git am` is in progress (rebase-apply/applying exists).
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn is_applying(&self, repo_dir: &Path) -> Result<bool, GitError> {
        self.git_path_exists(repo_dir, "rebase-apply/applying")
    }

    fn git_path_exists(&self, repo_dir: &Path, name: &str) -> Result<bool, GitError> {
        let out = self.run(Some(repo_dir), &["rev-parse", "--git-path", name])?;
        if !out.success() {
            return Ok(false);
        }
        let rel = PathBuf::from(out.stdout.trim());
        // rev-parse emits the path relative to the directory it ran in
        // unless the repository layout forces an absolute path.
        let full = if rel.is_absolute() {
            rel
        } else {
            repo_dir.join(rel)
        };
        Ok(full.exists())
    }

    /// Paths currently in conflict (`diff --name-only --diff-filter=U`).
    #[instrument(skip(self), fields(repo = %repo_dir.display()))]
    pub fn conflict_files(&self, repo_dir: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run(Some(repo_dir), &["diff", "--name-only", "--diff-filter=U"])?;
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Stage blob ids for an unmerged path, from `ls-files -u`.
    #[instrument(skip(self), fields(repo = %repo_dir.display(), path))]
    pub fn conflict_stages(&self, repo_dir: &Path, path: &str) -> Result<ConflictStages, GitError> {
        let out = self.run(Some(repo_dir), &["ls-files", "-u", "--", path])?;
        if !out.success() {
            return Ok(ConflictStages::default());
        }
        Ok(parse_ls_files_stages(&out.stdout))
    }

    // ---- worktree manipulation ----

    /// Check out one side of a conflicted path. Returns whether the
    /// checkout succeeded.
    #[instrument(skip(self), fields(repo = %repo_dir.display(), path, take_ours))]
    pub fn resolve_with_side(
        &self,
        repo_dir: &Path,
        path: &str,
        take_ours: bool,
    ) -> Result<bool, GitError> {
        let side = if take_ours { "--ours" } else { "--theirs" };
        let out = self.run(Some(repo_dir), &["checkout", side, "--", path])?;
        Ok(out.success())
    }

    /// Stage paths. Returns stderr; empty means success.
    #[instrument(skip(self, paths), fields(repo = %repo_dir.display(), count = paths.len()))]
    pub fn add_files(&self, repo_dir: &Path, paths: &[String]) -> Result<String, GitError> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        let out = self.run(Some(repo_dir), &args)?;
        Ok(out.stderr.trim().to_string())
    }

    // ---- config ----

    /// Read one config value. Returns an empty string when the key is
    /// unset in the requested scope.
    #[instrument(skip(self), fields(name, scope = ?scope))]
    pub fn config_value(
        &self,
        repo_dir: Option<&Path>,
        name: &str,
        scope: ConfigScope,
    ) -> Result<String, GitError> {
        let mut args = vec!["config"];
        match scope {
            ConfigScope::Effective => {}
            ConfigScope::Local => args.push("--local"),
            ConfigScope::Global => args.push("--global"),
        }
        args.push("--get");
        args.push(name);
        let out = self.run(repo_dir, &args)?;
        if !out.success() {
            return Ok(String::new());
        }
        Ok(out.stdout.trim().to_string())
    }

    // ---- plumbing ----

    fn run(&self, repo_dir: Option<&Path>, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = repo_dir {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            // English output keeps stderr phrase checks stable.
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(cmd = %format!("git {}", args.join(" ")), "running git command");
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound(e.to_string())
            } else {
                GitError::IoError(e)
            }
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            debug!(exit_code, "git command exited non-zero");
        }
        Ok(GitOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Parse `ls-files -u` output: `<mode> <sha> <stage>\t<path>` per line.
fn parse_ls_files_stages(output: &str) -> ConflictStages {
    let mut stages = ConflictStages::default();
    for line in output.lines() {
        let meta = match line.split('\t').next() {
            Some(m) => m,
            None => continue,
        };
        let mut fields = meta.split_whitespace();
        let (Some(_mode), Some(sha), Some(stage)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        match stage {
            "1" => stages.base = Some(sha.to_string()),
            "2" => stages.ours = Some(sha.to_string()),
            "3" => stages.theirs = Some(sha.to_string()),
            _ => {}
        }
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_files_full_conflict() {
        let output = "\
100644 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 1\tsrc/app.c
100644 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb 2\tsrc/app.c
100644 cccccccccccccccccccccccccccccccccccccccc 3\tsrc/app.c
";
        let stages = parse_ls_files_stages(output);
        assert_eq!(
            stages.base.as_deref(),
            Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        );
        assert_eq!(
            stages.ours.as_deref(),
            Some("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
        );
        assert_eq!(
            stages.theirs.as_deref(),
            Some("cccccccccccccccccccccccccccccccccccccccc")
        );
    }

    #[test]
    fn test_parse_ls_files_deleted_side() {
        // Delete/modify: theirs stage is absent.
        let output = "\
100644 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 1\tdoc/readme.md
100644 bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb 2\tdoc/readme.md
";
        let stages = parse_ls_files_stages(output);
        assert!(stages.base.is_some());
        assert!(stages.ours.is_some());
        assert!(stages.theirs.is_none());
    }

    #[test]
    fn test_parse_ls_files_empty() {
        let stages = parse_ls_files_stages("");
        assert!(stages.is_empty());
    }

    #[test]
    fn test_output_success() {
        let out = GitOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(out.success());
        let out = GitOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error".into(),
        };
        assert!(!out.success());
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let out = GitOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error: could not apply abc123\n".into(),
        };
        assert_eq!(out.error_text(), "error: could not apply abc123");
    }

    #[test]
    fn test_error_text_falls_back_to_exit_code() {
        let out = GitOutput {
            exit_code: 128,
            stdout: "noise".into(),
            stderr: "  \n".into(),
        };
        assert_eq!(out.error_text(), "git exited with status 128");
    }
}
