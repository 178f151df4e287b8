//! Reactive rebase before each stage and squash merge at completion.
//!
//! The [`Integrator`] trait keeps the relay loop independent of git; tests use
//! scripted integrators. Integration problems are returned as data so the
//! relay can block the task with a readable reason.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::IntegrationConfig;
use crate::io::git::Git;

/// How far the mainline has moved past a task branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseCheck {
    pub needs_rebase: bool,
    pub commits_behind: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Rebased { commit: String },
    /// Replay stopped on conflicts; the rebase is left in progress for resolution.
    Conflict { detail: String },
    /// Uncommitted changes; no rebase was attempted.
    DirtyTree { files: Vec<String> },
    /// Failed for another reason; callers abort the rebase.
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub commit: Option<String>,
    pub error: Option<String>,
}

impl MergeOutcome {
    fn merged(commit: String) -> Self {
        Self {
            success: true,
            commit: Some(commit),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            commit: None,
            error: Some(error.into()),
        }
    }
}

pub trait Integrator: Send + Sync {
    /// Make sure the task branch exists and is checked out.
    fn prepare_branch(&self, branch: &str) -> Result<()>;

    fn check_needs_rebase(&self, branch: &str) -> Result<RebaseCheck>;

    fn perform_rebase(&self, branch: &str) -> Result<RebaseOutcome>;

    fn abort_rebase(&self) -> Result<()>;

    /// True when `branch` merges into the mainline without conflicts.
    fn check_for_conflicts(&self, branch: &str) -> Result<bool>;

    fn perform_squash_merge(&self, task_id: &str, branch: &str) -> Result<MergeOutcome>;

    fn cleanup_task_branch(&self, branch: &str) -> Result<()>;

    /// Commit whatever the worker left in the checkout onto `branch`.
    ///
    /// Returns the new commit, or `None` when there was nothing to commit.
    fn commit_work(&self, branch: &str, message: &str) -> Result<Option<String>>;

    /// Files the task branch changed relative to the mainline.
    fn touched_files(&self, branch: &str) -> Result<Vec<String>>;
}

/// Integrator for runs without version control.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIntegrator;

impl Integrator for NoopIntegrator {
    fn prepare_branch(&self, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn check_needs_rebase(&self, _branch: &str) -> Result<RebaseCheck> {
        Ok(RebaseCheck {
            needs_rebase: false,
            commits_behind: 0,
        })
    }

    fn perform_rebase(&self, _branch: &str) -> Result<RebaseOutcome> {
        Ok(RebaseOutcome::Rebased {
            commit: String::new(),
        })
    }

    fn abort_rebase(&self) -> Result<()> {
        Ok(())
    }

    fn check_for_conflicts(&self, _branch: &str) -> Result<bool> {
        Ok(true)
    }

    fn perform_squash_merge(&self, _task_id: &str, _branch: &str) -> Result<MergeOutcome> {
        Ok(MergeOutcome::merged(String::new()))
    }

    fn cleanup_task_branch(&self, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn commit_work(&self, _branch: &str, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn touched_files(&self, _branch: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Git-backed integrator working in a single checkout.
#[derive(Debug, Clone)]
pub struct GitIntegrator {
    git: Git,
    mainline: String,
    remote: Option<String>,
    /// Worktree paths ignored by the dirty-tree check (the relay's own cache).
    ignored_prefixes: Vec<String>,
}

impl GitIntegrator {
    pub fn new(workdir: impl Into<PathBuf>, config: &IntegrationConfig) -> Self {
        Self {
            git: Git::new(workdir),
            mainline: config.mainline.clone(),
            remote: config.remote.clone(),
            ignored_prefixes: Vec::new(),
        }
    }

    pub fn ignoring(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_prefixes.push(prefix.into());
        self
    }

    /// Ref the task branch is compared with and rebased onto.
    fn upstream(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{remote}/{}", self.mainline),
            None => self.mainline.clone(),
        }
    }

    fn dirty_files(&self) -> Result<Vec<String>> {
        let ignored: Vec<&str> = self.ignored_prefixes.iter().map(String::as_str).collect();
        Ok(self
            .git
            .dirty_entries(&ignored)?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    fn ensure_on(&self, branch: &str) -> Result<()> {
        if self.git.current_branch()? != branch {
            self.git.checkout_branch(branch)?;
        }
        Ok(())
    }

    /// Put the checkout back on the mainline after a failed squash.
    fn undo_squash(&self) {
        match self.git.merge_abort() {
            Ok(run) if run.success => return,
            Ok(_) => {}
            Err(err) => warn!(err = %err, "merge --abort failed"),
        }
        if let Err(err) = self.git.reset_hard("HEAD") {
            warn!(err = %err, "reset --hard after failed squash failed");
        }
    }
}

impl Integrator for GitIntegrator {
    #[instrument(skip_all, fields(branch))]
    fn prepare_branch(&self, branch: &str) -> Result<()> {
        if self.git.branch_exists(branch)? {
            return self.ensure_on(branch);
        }
        let dirty = self.dirty_files()?;
        if !dirty.is_empty() {
            return Err(anyhow!(
                "cannot create branch {branch}: working tree has uncommitted changes ({})",
                dirty.join(", ")
            ));
        }
        self.git.checkout_branch(&self.mainline)?;
        self.git.checkout_new_branch(branch)?;
        info!(branch, mainline = %self.mainline, "created task branch");
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn check_needs_rebase(&self, branch: &str) -> Result<RebaseCheck> {
        if let Some(remote) = &self.remote {
            self.git.fetch(remote, &self.mainline)?;
        }
        let commits_behind = self.git.count_commits(branch, &self.upstream())?;
        debug!(commits_behind, "mainline comparison");
        Ok(RebaseCheck {
            needs_rebase: commits_behind > 0,
            commits_behind,
        })
    }

    #[instrument(skip_all, fields(branch))]
    fn perform_rebase(&self, branch: &str) -> Result<RebaseOutcome> {
        let dirty = self.dirty_files()?;
        if !dirty.is_empty() {
            warn!(files = dirty.len(), "refusing to rebase a dirty working tree");
            return Ok(RebaseOutcome::DirtyTree { files: dirty });
        }
        self.ensure_on(branch)?;
        let run = self.git.rebase(&self.upstream())?;
        if run.success {
            let commit = self.git.rev_parse("HEAD")?;
            info!(commit = %commit, "rebased onto mainline");
            return Ok(RebaseOutcome::Rebased { commit });
        }
        if run.has_conflicts() {
            warn!("rebase stopped on conflicts");
            return Ok(RebaseOutcome::Conflict {
                detail: run.combined(),
            });
        }
        Ok(RebaseOutcome::Failed {
            detail: run.combined(),
        })
    }

    fn abort_rebase(&self) -> Result<()> {
        let run = self.git.rebase_abort()?;
        if !run.success {
            debug!(detail = %run.combined(), "no rebase to abort");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn check_for_conflicts(&self, branch: &str) -> Result<bool> {
        self.git.merge_tree_clean(&self.mainline, branch)
    }

    #[instrument(skip_all, fields(task_id, branch))]
    fn perform_squash_merge(&self, task_id: &str, branch: &str) -> Result<MergeOutcome> {
        let dirty = self.dirty_files()?;
        if !dirty.is_empty() {
            return Ok(MergeOutcome::failed(format!(
                "working tree has uncommitted changes: {}",
                dirty.join(", ")
            )));
        }
        self.git.checkout_branch(&self.mainline)?;
        let run = self.git.merge_squash(branch)?;
        if !run.success {
            warn!("squash merge failed, restoring mainline");
            self.undo_squash();
            return Ok(MergeOutcome::failed(run.combined()));
        }
        let message = format!("relay: squash merge {task_id} ({branch})");
        match self.git.commit_staged(&message) {
            Ok(true) => {}
            Ok(false) => debug!("branch had no changes relative to mainline"),
            Err(err) => {
                self.undo_squash();
                return Ok(MergeOutcome::failed(format!("{err:#}")));
            }
        }
        let commit = self.git.rev_parse("HEAD")?;
        info!(commit = %commit, "squash merged");
        Ok(MergeOutcome::merged(commit))
    }

    #[instrument(skip_all, fields(branch))]
    fn cleanup_task_branch(&self, branch: &str) -> Result<()> {
        if self.git.current_branch()? == branch {
            self.git.checkout_branch(&self.mainline)?;
        }
        self.git.delete_branch(branch)
    }

    #[instrument(skip_all, fields(branch))]
    fn commit_work(&self, branch: &str, message: &str) -> Result<Option<String>> {
        self.ensure_on(branch)?;
        let ignored: Vec<&str> = self.ignored_prefixes.iter().map(String::as_str).collect();
        self.git.add_all(&ignored)?;
        if !self.git.commit_staged(message)? {
            return Ok(None);
        }
        let commit = self.git.rev_parse("HEAD")?;
        debug!(commit = %commit, "committed worker output");
        Ok(Some(commit))
    }

    fn touched_files(&self, branch: &str) -> Result<Vec<String>> {
        self.git.diff_names(&self.mainline, branch)
    }
}
