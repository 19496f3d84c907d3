//! Backend that replays commits with the `git` CLI in a private clone.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::backend::{Backend, BackendError, Session};
use crate::git::{self, Git};
use crate::model::{Commit, CommitId, RefHandle, RepoId};

const REMOTE: &str = "origin";

/// What to do when a cherry-pick does not apply cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Abort and fail the step.
    #[default]
    Abort,
    /// Retry once resolving conflicting hunks in favour of the rebuilt
    /// chain, then fail the step if that does not apply either.
    PreferOurs,
}

/// Settings for [`LocalCliBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Clone URL; `{repo}` is replaced with `owner/name`
    pub clone_url: String,

    pub committer_name: Option<String>,

    pub committer_email: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            clone_url: "https://github.com/{repo}.git".to_string(),
            committer_name: None,
            committer_email: None,
        }
    }
}

/// Rewrites history in a fresh clone and publishes with `push --force`.
pub struct LocalCliBackend {
    name: String,
    config: LocalConfig,
    token: Option<String>,
    conflicts: ConflictPolicy,
}

impl LocalCliBackend {
    pub fn new(config: LocalConfig, token: Option<String>, conflicts: ConflictPolicy) -> Self {
        let name = match conflicts {
            ConflictPolicy::Abort => "local",
            ConflictPolicy::PreferOurs => "local-ours",
        };
        Self {
            name: name.to_string(),
            config,
            token,
            conflicts,
        }
    }

    /// Cherry-pick one commit onto `branch` and push the result.
    ///
    /// Merge commits are applied against their first parent.
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn apply_commit(
        &self,
        repo: &RepoId,
        branch: &str,
        commit: &str,
    ) -> Result<Commit, BackendError> {
        let mut session = self.open(repo)?;
        let target = session.resolve_branch(branch)?;
        let original = session.get_commit(&CommitId::new(commit))?;
        let mainline = original.is_merge().then_some(1);
        let applied = session.create_commit(&original, Some(&target.target), mainline)?;
        session.force_update(&target, &applied.id)?;
        tracing::info!(
            original = %original.id.short(),
            applied = %applied.id.short(),
            "applied commit"
        );
        Ok(applied)
    }

    /// The URL to clone `repo` from, with the token embedded for https remotes.
    pub fn clone_url(&self, repo: &RepoId) -> String {
        let url = self.config.clone_url.replace("{repo}", &repo.to_string());
        match (&self.token, url.strip_prefix("https://")) {
            (Some(token), Some(rest)) if !rest.contains('@') => {
                format!("https://x-access-token:{token}@{rest}")
            }
            _ => url,
        }
    }
}

impl Backend for LocalCliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, repo: &RepoId) -> Result<Box<dyn Session>, BackendError> {
        let workdir = tempfile::Builder::new()
            .prefix("excise-")
            .tempdir()
            .map_err(|e| BackendError::Unavailable(format!("creating working directory: {e}")))?;

        tracing::info!(repo = %repo, dir = %workdir.path().display(), "cloning repository");
        let mut git = Git::clone_into(&self.clone_url(repo), workdir.path()).map_err(from_git)?;
        if let Some(name) = &self.config.committer_name {
            git = git.with_config("user.name", name);
        }
        if let Some(email) = &self.config.committer_email {
            git = git.with_config("user.email", email);
        }
        // Detach so that any branch, including the default one, can be moved.
        git.checkout_detach(None).map_err(from_git)?;
        git.reset_hard("HEAD").map_err(from_git)?;

        Ok(Box::new(LocalSession {
            git,
            conflicts: self.conflicts,
            published: HashSet::new(),
            persisted: HashSet::new(),
            _workdir: workdir,
        }))
    }
}

/// One clone, owned by one rewrite attempt and removed when dropped.
struct LocalSession {
    git: Git,
    conflicts: ConflictPolicy,
    /// Branches resolved from the remote; updating these means pushing.
    published: HashSet<String>,
    /// Session branches pushed by `persist`; deleting these means pushing.
    persisted: HashSet<String>,
    _workdir: TempDir,
}

impl LocalSession {
    fn remote_ref(branch: &str) -> String {
        format!("refs/remotes/{REMOTE}/{branch}")
    }

    fn commit(&self, rev: &str) -> Result<Commit, BackendError> {
        self.git
            .log(rev, Some(1))
            .map_err(from_git)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::RefNotFound(rev.to_string()))
    }

    fn pick(&self, original: &Commit, mainline: Option<usize>) -> Result<(), BackendError> {
        let sha = original.id.as_str();
        let first = self.git.cherry_pick(sha, mainline, false);
        let Err(first_err) = first else {
            return Ok(());
        };
        // A failed pick leaves the index mid-operation; clear it before anything else.
        self.abort_pick(original);

        if self.conflicts == ConflictPolicy::PreferOurs {
            tracing::warn!(commit = %original.id.short(), "cherry-pick conflicted, retrying preferring ours");
            match self.git.cherry_pick(sha, mainline, true) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.abort_pick(original);
                    return Err(conflict(original, e));
                }
            }
        }
        Err(conflict(original, first_err))
    }

    fn abort_pick(&self, original: &Commit) {
        if let Err(e) = self.git.cherry_pick_abort() {
            tracing::warn!(
                commit = %original.id.short(),
                error = %e,
                "cherry-pick --abort failed, clone may be left mid-pick"
            );
        }
    }
}

impl Session for LocalSession {
    fn resolve_branch(&mut self, branch: &str) -> Result<RefHandle, BackendError> {
        let sha = self
            .git
            .verify_commit(&Self::remote_ref(branch))
            .map_err(from_git)?
            .ok_or_else(|| BackendError::RefNotFound(branch.to_string()))?;
        self.published.insert(branch.to_string());
        Ok(RefHandle::new(branch, CommitId::new(sha)))
    }

    fn create_branch(&mut self, name: &str, at: &CommitId) -> Result<RefHandle, BackendError> {
        self.git
            .checkout_new_branch(name, at.as_str())
            .map_err(from_git)?;
        Ok(RefHandle::new(name, at.clone()))
    }

    fn force_update(
        &mut self,
        handle: &RefHandle,
        to: &CommitId,
    ) -> Result<RefHandle, BackendError> {
        if self.published.contains(&handle.name) {
            tracing::info!(branch = %handle.name, to = %to.short(), "pushing rewritten branch");
            self.git
                .branch_force(&handle.name, to.as_str())
                .map_err(from_git)?;
            self.git.push_force(REMOTE, &handle.name).map_err(from_git)?;
        } else if self.git.current_branch().map_err(from_git)?.as_deref() == Some(handle.name.as_str()) {
            self.git.reset_hard(to.as_str()).map_err(from_git)?;
        } else {
            self.git
                .branch_force(&handle.name, to.as_str())
                .map_err(from_git)?;
        }
        Ok(RefHandle::new(handle.name.clone(), to.clone()))
    }

    fn list_commits(&mut self, branch: &str) -> Result<Vec<Commit>, BackendError> {
        self.git
            .log(&Self::remote_ref(branch), None)
            .map_err(from_git)
    }

    fn get_commit(&mut self, id: &CommitId) -> Result<Commit, BackendError> {
        self.commit(id.as_str())
    }

    fn create_commit(
        &mut self,
        original: &Commit,
        parent: Option<&CommitId>,
        mainline: Option<usize>,
    ) -> Result<Commit, BackendError> {
        let Some(parent) = parent else {
            let sha = self
                .git
                .commit_tree_root(original.id.as_str(), &original.message, &original.author)
                .map_err(from_git)?;
            return self.commit(&sha);
        };

        if self.git.head().map_err(from_git)? != parent.as_str() {
            self.git.reset_hard(parent.as_str()).map_err(from_git)?;
        }
        self.pick(original, mainline)?;
        let head = self.git.head().map_err(from_git)?;
        self.commit(&head)
    }

    fn delete_ref(&mut self, handle: &RefHandle) -> Result<(), BackendError> {
        if self.git.current_branch().map_err(from_git)?.as_deref() == Some(handle.name.as_str()) {
            self.git.checkout_detach(None).map_err(from_git)?;
        }
        if !self.git.delete_branch(&handle.name).map_err(from_git)? {
            tracing::debug!(branch = %handle.name, "branch already gone");
        }
        if self.persisted.remove(&handle.name) {
            self.git
                .push_delete(REMOTE, &handle.name)
                .map_err(from_git)?;
        }
        Ok(())
    }

    fn persist(&mut self, handle: &RefHandle) -> Result<(), BackendError> {
        if self.published.contains(&handle.name) {
            return Ok(());
        }
        tracing::debug!(branch = %handle.name, "pushing staged branch");
        self.git.push_force(REMOTE, &handle.name).map_err(from_git)?;
        self.persisted.insert(handle.name.clone());
        Ok(())
    }
}

fn conflict(original: &Commit, err: git::Error) -> BackendError {
    BackendError::Conflict {
        commit: original.id.clone(),
        detail: err.to_string(),
    }
}

fn from_git(err: git::Error) -> BackendError {
    match err {
        git::Error::Exec { .. } => BackendError::Unavailable(err.to_string()),
        git::Error::Failed {
            ref command,
            ref stderr,
            ..
        } => BackendError::Rejected {
            operation: format!("git {}", command.split(' ').next().unwrap_or("")),
            status: None,
            message: stderr.clone(),
        },
    }
}
