//! Git source updater.
//!
//! Runs inside the update worker process. Each project is described by a
//! lean, serializable [`UpdateTask`] so the worker does not need the full
//! configuration; outcomes flow back to the build-parent over IPC.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ipc::UpdaterIpc;
use crate::process::{self, LoggedRun};

/// Everything the updater needs to know about one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTask {
    pub name: String,
    pub source_dir: PathBuf,
    pub repository: String,
    /// Desired branch after branch-group resolution; `None` = remote HEAD.
    pub branch: Option<String>,
    pub tag: Option<String>,
    /// A pinned commit or revision; strongest preference.
    pub commit: Option<String>,
    /// `user.name <email>` to configure on fresh clones.
    pub git_user: Option<String>,
    /// Expected build directory; its absence becomes the refresh reason
    /// reported with an otherwise up-to-date checkout.
    pub build_dir: Option<PathBuf>,
    pub update_log: PathBuf,
    pub pretend: bool,
}

/// Outcome of one project's update phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub commits_pulled: u64,
    /// Messages the build-parent should print at end of run.
    pub post_build_messages: Vec<String>,
}

/// Checkout preference: `commit` > `tag` > `branch` > remote HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutSource {
    Commit(String),
    Tag(String),
    Branch(String),
    RemoteHead,
}

pub fn preferred_checkout_source(task: &UpdateTask) -> CheckoutSource {
    if let Some(commit) = task.commit.as_ref().filter(|s| !s.is_empty()) {
        return CheckoutSource::Commit(commit.clone());
    }
    if let Some(tag) = task.tag.as_ref().filter(|s| !s.is_empty()) {
        return CheckoutSource::Tag(tag.clone());
    }
    if let Some(branch) = task.branch.as_ref().filter(|s| !s.is_empty()) {
        return CheckoutSource::Branch(branch.clone());
    }
    CheckoutSource::RemoteHead
}

fn git_program() -> String {
    std::env::var("KDE_BUILDER_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

/// Pick a local branch name for tracking `remote/branch`. Idempotent when
/// the proposed name is free; otherwise derives a unique new name.
pub fn make_branchname(existing: &[String], remote: &str, branch: &str) -> String {
    if !existing.iter().any(|b| b == branch) {
        return branch.to_string();
    }
    let base = format!("{remote}-{branch}");
    if !existing.iter().any(|b| *b == base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.iter().any(|b| *b == candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Update one project's source checkout, reporting through `ipc`.
pub fn update_project(task: &UpdateTask, ipc: &mut UpdaterIpc<'_>) -> Result<UpdateResult> {
    let mut updater = GitUpdater {
        task,
        post_build_messages: Vec::new(),
    };
    let commits = updater.run(ipc)?;
    Ok(UpdateResult {
        commits_pulled: commits,
        post_build_messages: updater.post_build_messages,
    })
}

struct GitUpdater<'a> {
    task: &'a UpdateTask,
    post_build_messages: Vec<String>,
}

impl GitUpdater<'_> {
    fn run(&mut self, ipc: &mut UpdaterIpc<'_>) -> Result<u64> {
        let src = &self.task.source_dir;
        if let Some(parent) = src.parent() {
            if !self.task.pretend {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        if !src.join(".git").exists() {
            self.clone_repository(ipc)?;
            return self.count_pulled_commits();
        }

        self.reconcile_remote()?;
        self.fetch()?;
        self.switch_to_requested_ref(ipc)?;
        self.count_pulled_commits()
    }

    fn git_quiet(&self, args: &[&str]) -> Result<(i32, String)> {
        let mut argv = vec![git_program()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let cwd = if self.task.source_dir.is_dir() {
            Some(self.task.source_dir.as_path())
        } else {
            None
        };
        process::capture_output(&argv, cwd, &BTreeMap::new())
    }

    fn git_logged(&self, args: &[&str], cwd: Option<&Path>) -> Result<i32> {
        let mut argv = vec![git_program()];
        argv.extend(args.iter().map(|s| s.to_string()));
        process::run_logged(
            &LoggedRun {
                argv: &argv,
                log_path: &self.task.update_log,
                cwd: cwd.or(Some(self.task.source_dir.as_path())),
                env: &BTreeMap::new(),
                pretend: self.task.pretend,
            },
            None,
        )
    }

    fn clone_repository(&mut self, ipc: &mut UpdaterIpc<'_>) -> Result<()> {
        let task = self.task;
        let source = preferred_checkout_source(task);

        // Verify a requested named ref is actually reachable before paying
        // for the clone.
        if !task.pretend {
            if let CheckoutSource::Branch(name) | CheckoutSource::Tag(name) = &source {
                let (code, _) = self.git_quiet(&[
                    "ls-remote",
                    "--exit-code",
                    &task.repository,
                    name,
                ])?;
                if code != 0 {
                    bail!(
                        "{}: ref {name} is not present on {}",
                        task.name,
                        task.repository
                    );
                }
            }
        }

        let mut args: Vec<&str> = vec!["clone", "--recursive"];
        let refname;
        if let CheckoutSource::Branch(name) | CheckoutSource::Tag(name) = &source {
            refname = name.clone();
            args.push("-b");
            args.push(&refname);
        }
        args.push(&task.repository);
        let dest = task.source_dir.display().to_string();
        args.push(&dest);

        let clone_cwd = task
            .source_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let code = self.git_logged(&args, Some(&clone_cwd))?;
        if code != 0 {
            bail!("{}: git clone failed with exit code {code}", task.name);
        }

        if let CheckoutSource::Commit(commit) = &source {
            let code = self.git_logged(&["checkout", "--detach", commit], None)?;
            if code != 0 {
                bail!("{}: cannot check out commit {commit}", task.name);
            }
        }

        if !task.pretend {
            if let Some(user) = &task.git_user {
                self.configure_identity(user)?;
            }
        }

        ipc.notify_persistent_option_change(
            &task.name,
            "git-cloned-repository",
            &task.repository,
        )?;
        Ok(())
    }

    fn configure_identity(&self, user: &str) -> Result<()> {
        let (name, email) = match user.rsplit_once('<') {
            Some((name, rest)) => (name.trim(), rest.trim_end_matches('>').trim()),
            None => (user.trim(), ""),
        };
        self.git_quiet(&["config", "--local", "user.name", name])?;
        if !email.is_empty() {
            self.git_quiet(&["config", "--local", "user.email", email])?;
        }
        Ok(())
    }

    /// Find (or repoint) the remote matching the configured URL. Prefers an
    /// existing remote whose URL already matches, including the `kde:`
    /// alias spelling; falls back to repointing `origin`.
    fn reconcile_remote(&self) -> Result<String> {
        let (_, remotes) = self.git_quiet(&["remote"])?;
        let wanted = &self.task.repository;

        let mut origin_seen = false;
        for remote in remotes.split_whitespace() {
            let (code, url) = self.git_quiet(&["remote", "get-url", remote])?;
            if code != 0 {
                continue;
            }
            if url == *wanted || urls_alias_equal(&url, wanted) {
                return Ok(remote.to_string());
            }
            if remote == "origin" {
                origin_seen = true;
            }
        }

        if origin_seen {
            debug!(project = %self.task.name, "updating origin fetch URL");
            self.git_quiet(&["remote", "set-url", "origin", wanted])?;
        } else {
            self.git_quiet(&["remote", "add", "origin", wanted])?;
        }
        Ok("origin".to_string())
    }

    fn fetch(&self) -> Result<()> {
        let remote = self.reconcile_remote()?;
        let code = self.git_logged(&["fetch", "--force", "--tags", "--prune", &remote], None)?;
        if code != 0 {
            bail!("{}: git fetch failed with exit code {code}", self.task.name);
        }
        Ok(())
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let (code, out) = self.git_quiet(&["symbolic-ref", "--short", "-q", "HEAD"])?;
        Ok(if code == 0 && !out.is_empty() {
            Some(out)
        } else {
            None
        })
    }

    fn working_tree_dirty(&self) -> Result<bool> {
        let (code, out) = self.git_quiet(&["status", "--porcelain"])?;
        if code != 0 {
            bail!("{}: git status failed", self.task.name);
        }
        Ok(!out.is_empty())
    }

    fn switch_to_requested_ref(&mut self, ipc: &mut UpdaterIpc<'_>) -> Result<()> {
        let task = self.task;

        // Branches used for in-progress work are never switched away from.
        if let Some(current) = self.current_branch()? {
            if current.starts_with("work/") || current.starts_with("mr/") {
                debug!(project = %task.name, branch = %current, "holding work branch");
                return Ok(());
            }
        }

        let source = preferred_checkout_source(task);
        let remote = self.reconcile_remote()?;

        match source {
            CheckoutSource::Commit(refname) | CheckoutSource::Tag(refname) => {
                self.with_stash(ipc, &format!("detached checkout of {refname}"), |s| {
                    let code = s.git_logged(&["checkout", "--detach", &refname], None)?;
                    if code != 0 {
                        bail!("{}: cannot check out {refname}", s.task.name);
                    }
                    Ok(())
                })
            }
            CheckoutSource::Branch(branch) => self.switch_to_branch(ipc, &remote, &branch),
            CheckoutSource::RemoteHead => {
                // No preference given; fast-forward whatever is checked out.
                if let Some(current) = self.current_branch()? {
                    self.update_branch(ipc, &remote, &current)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn switch_to_branch(
        &mut self,
        ipc: &mut UpdaterIpc<'_>,
        remote: &str,
        branch: &str,
    ) -> Result<()> {
        let current = self.current_branch()?;
        if current.as_deref() == Some(branch) {
            return self.update_branch(ipc, remote, branch);
        }

        // A dirty tree belonging to another branch would have to be stashed
        // across a branch switch, where reapplying routinely conflicts.
        // Leave the checkout alone and tell the user at end of run.
        if self.working_tree_dirty()? {
            let msg = format!(
                "{}: has uncommitted changes on branch {}; branch switch to {} was not performed",
                self.task.name,
                current.as_deref().unwrap_or("(detached)"),
                branch
            );
            warn!("{msg}");
            ipc.notify_post_build_message(&self.task.name, &msg)?;
            self.post_build_messages.push(msg);
            return Ok(());
        }

        let (branches_code, branch_list) =
            self.git_quiet(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        if branches_code != 0 {
            bail!("{}: cannot enumerate local branches", self.task.name);
        }
        let existing: Vec<String> = branch_list
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let code = if existing.iter().any(|b| b == branch) {
            self.git_logged(&["checkout", branch], None)?
        } else {
            let local = make_branchname(&existing, remote, branch);
            self.git_logged(
                &[
                    "checkout",
                    "-b",
                    &local,
                    &format!("{remote}/{branch}"),
                ],
                None,
            )?
        };
        if code != 0 {
            bail!("{}: cannot switch to branch {branch}", self.task.name);
        }
        self.update_branch(ipc, remote, branch)
    }

    /// Reconcile the checked-out branch with its remote head: fast-forward
    /// when possible, hard reset otherwise.
    fn update_branch(
        &mut self,
        ipc: &mut UpdaterIpc<'_>,
        remote: &str,
        branch: &str,
    ) -> Result<()> {
        let target = format!("{remote}/{branch}");
        let (code, _) = self.git_quiet(&["rev-parse", "--verify", "-q", &target])?;
        if code != 0 {
            debug!(project = %self.task.name, %target, "no remote head to reconcile with");
            return Ok(());
        }

        self.with_stash(ipc, &format!("update of {branch}"), |s| {
            let ff = s.git_logged(&["merge", "--ff-only", &target], None)?;
            if ff != 0 {
                let reset = s.git_logged(&["reset", "--hard", &target], None)?;
                if reset != 0 {
                    bail!("{}: cannot reset to {target}", s.task.name);
                }
            }
            Ok(())
        })
    }

    /// Stash local changes (untracked included) around `op`, popping after.
    /// A pop conflict leaves the stash in place and defers a message.
    fn with_stash(
        &mut self,
        ipc: &mut UpdaterIpc<'_>,
        what: &str,
        op: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        if self.task.pretend || !self.working_tree_dirty()? {
            return op(self);
        }

        let stash_name = format!(
            "kde-builder auto-stash at {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let (code, _) =
            self.git_quiet(&["stash", "push", "-u", "-m", &stash_name])?;
        if code != 0 {
            bail!(
                "{}: unable to stash local changes before {what}",
                self.task.name
            );
        }

        op(self)?;

        let (pop_code, _) = self.git_quiet(&["stash", "pop"])?;
        if pop_code != 0 {
            let msg = format!(
                "{}: stash \"{stash_name}\" could not be reapplied after {what}; it was kept for manual recovery",
                self.task.name
            );
            warn!("{msg}");
            ipc.notify_post_build_message(&self.task.name, &msg)?;
            self.post_build_messages.push(msg);
        }
        Ok(())
    }

    fn count_pulled_commits(&self) -> Result<u64> {
        if self.task.pretend {
            return Ok(0);
        }
        let (code, out) = self.git_quiet(&["rev-list", "--count", "HEAD@{1}..HEAD"])?;
        if code != 0 {
            // Fresh clones have no reflog entry to diff against.
            return Ok(0);
        }
        Ok(out.parse().unwrap_or(0))
    }
}

/// Current HEAD commit of a checkout, used to record `last-build-rev`.
pub fn current_revision(source_dir: &Path) -> Option<String> {
    let argv = vec![
        git_program(),
        "rev-parse".to_string(),
        "HEAD".to_string(),
    ];
    match process::capture_output(&argv, Some(source_dir), &BTreeMap::new()) {
        Ok((0, out)) if !out.is_empty() => Some(out),
        _ => None,
    }
}

/// Compare two repository URLs treating the `kde:` alias as equivalent to
/// its common expansions.
fn urls_alias_equal(a: &str, b: &str) -> bool {
    fn tail(url: &str) -> Option<&str> {
        let stripped = url
            .strip_prefix("kde:")
            .or_else(|| url.strip_prefix("https://invent.kde.org/"))
            .or_else(|| url.strip_prefix("git@invent.kde.org:"))?;
        Some(stripped.trim_end_matches(".git"))
    }
    match (tail(a), tail(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
