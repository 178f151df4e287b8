//! Git adapter for the integrator.
//!
//! Every version-control operation the engine performs goes through this small
//! wrapper around `git` subprocess calls. Commands whose failure is an expected
//! outcome (rebase, merge, merge-tree) return the raw result for the caller to
//! classify instead of an error.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of a command that is allowed to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRun {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitRun {
    fn from_output(output: &Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }

    /// True if the output reports merge conflicts (as opposed to other failures).
    pub fn has_conflicts(&self) -> bool {
        let text = self.combined();
        text.contains("CONFLICT") || text.contains("could not apply") || text.contains("Merge conflict")
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", rev])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Uncommitted changes, ignoring paths under any of `ignored_prefixes`.
    pub fn dirty_entries(&self, ignored_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !ignored_prefixes.iter().any(|p| entry.path.starts_with(p)))
            .collect())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage every change in the worktree except paths under `excluded_prefixes`.
    #[instrument(skip_all)]
    pub fn add_all(&self, excluded_prefixes: &[&str]) -> Result<()> {
        let excludes: Vec<String> = excluded_prefixes
            .iter()
            .map(|prefix| format!(":(exclude){prefix}"))
            .collect();
        let mut args = vec!["add", "-A", "--", "."];
        args.extend(excludes.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, branch])?;
        Ok(())
    }

    /// Number of commits reachable from `to` but not from `from`.
    pub fn count_commits(&self, from: &str, to: &str) -> Result<u32> {
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count {:?}", out.trim()))
    }

    /// Files changed between `base` and `head` (merge-base diff).
    pub fn diff_names(&self, base: &str, head: &str) -> Result<Vec<String>> {
        let range = format!("{base}...{head}");
        let out = self.run_capture(&["diff", "--name-only", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Rebase the current branch onto `upstream`. Failure is returned, not raised.
    #[instrument(skip_all, fields(upstream))]
    pub fn rebase(&self, upstream: &str) -> Result<GitRun> {
        self.run_allowing_failure(&["rebase", upstream])
    }

    pub fn rebase_abort(&self) -> Result<GitRun> {
        self.run_allowing_failure(&["rebase", "--abort"])
    }

    /// True if `ours` and `theirs` merge without conflicts (no worktree changes).
    ///
    /// Uses `git merge-tree --write-tree`: exit 0 is clean, 1 is conflicted.
    #[instrument(skip_all, fields(ours, theirs))]
    pub fn merge_tree_clean(&self, ours: &str, theirs: &str) -> Result<bool> {
        let output = self.run(&["merge-tree", "--write-tree", ours, theirs])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(anyhow!(
                "git merge-tree failed ({code:?}): {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Stage a squash of `branch` into the current branch.
    pub fn merge_squash(&self, branch: &str) -> Result<GitRun> {
        self.run_allowing_failure(&["merge", "--squash", branch])
    }

    pub fn merge_abort(&self) -> Result<GitRun> {
        self.run_allowing_failure(&["merge", "--abort"])
    }

    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev])?;
        Ok(())
    }

    /// Delete a local branch. `-D` because squash-merged branches look unmerged to git.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run_allowing_failure(&self, args: &[&str]) -> Result<GitRun> {
        let run = GitRun::from_output(&self.run(args)?);
        if !run.success {
            debug!(args = %args.join(" "), stderr = %run.stderr.trim(), "git command failed");
        }
        Ok(run)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_EDITOR", "true")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
