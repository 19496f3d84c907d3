//! The history rewriter: drop commits from a branch by replaying the rest.
//!
//! A rewrite stages the new chain on a temporary branch and only touches the
//! visible branch once, at the very end, with a single force-update. Every
//! failure before that point leaves the branch exactly where it was and
//! deletes the temporary branch.
//!
//! Backends are tried in the configured order. Each attempt starts from
//! scratch with a fresh session, so a failed hosted attempt and a following
//! local attempt never share intermediate commits.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backend::{Backend, BackendError, Session};
use crate::model::{Commit, CommitId, RefHandle, RepoId, temp_ref_name};
use crate::plan::{PlanError, RewritePlan};

/// Limits applied to one rewrite across all backends.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    /// Ceiling on total elapsed time, checked between replay steps
    pub deadline: Option<Duration>,

    /// Cancels the rewrite at the next step boundary before publishing
    pub cancel: CancellationToken,
}

impl RewriteOptions {
    fn checkpoint(&self, started: Instant, completed: usize) -> Result<(), RewriteError> {
        if self.cancel.is_cancelled() {
            return Err(RewriteError::Cancelled { completed });
        }
        match self.deadline {
            Some(limit) if started.elapsed() > limit => {
                Err(RewriteError::DeadlineExceeded { limit, completed })
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of a successful rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteResult {
    /// Backend that performed the rewrite
    pub backend: String,

    pub old_tip: CommitId,

    pub new_tip: CommitId,

    pub removed: Vec<CommitId>,

    /// Number of commits recreated on the new chain
    pub replayed: usize,
}

/// Removes commits from branches using an ordered list of backends.
pub struct HistoryRewriter {
    backends: Vec<Box<dyn Backend>>,
    options: RewriteOptions,
}

impl HistoryRewriter {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self {
            backends,
            options: RewriteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RewriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Remove `remove` from `branch` and publish the rebuilt history.
    ///
    /// This is destructive: once the branch has been force-updated the
    /// removed commits are no longer reachable from it.
    pub fn rewrite_history(
        &self,
        repo: &RepoId,
        branch: &str,
        remove: &[String],
    ) -> Result<RewriteResult, RewriteError> {
        let started = Instant::now();
        let mut attempts = Vec::new();

        for backend in &self.backends {
            match attempt(backend.as_ref(), repo, branch, remove, &self.options, started) {
                Ok(result) => {
                    tracing::info!(
                        backend = backend.name(),
                        old_tip = %result.old_tip.short(),
                        new_tip = %result.new_tip.short(),
                        removed = result.removed.len(),
                        "history rewritten"
                    );
                    return Ok(result);
                }
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        backend = backend.name(),
                        error = %error_chain(&err),
                        "rewrite attempt failed, trying next backend"
                    );
                    attempts.push(FailedAttempt {
                        backend: backend.name().to_string(),
                        error: err,
                    });
                }
            }
        }

        Err(RewriteError::Exhausted { attempts })
    }

    /// Compute what a rewrite would do without changing anything.
    pub fn plan(
        &self,
        repo: &RepoId,
        branch: &str,
        remove: &[String],
    ) -> Result<RewritePlan, RewriteError> {
        self.first_success(|session| {
            let history = read_history(session, branch)?;
            RewritePlan::compute(&history, remove).map_err(|e| RewriteError::from_plan(branch, e))
        }, repo)
    }

    /// List the commits of `branch`, newest first.
    pub fn log(&self, repo: &RepoId, branch: &str) -> Result<Vec<Commit>, RewriteError> {
        self.first_success(|session| read_history(session, branch), repo)
    }

    fn first_success<T>(
        &self,
        mut f: impl FnMut(&mut dyn Session) -> Result<T, RewriteError>,
        repo: &RepoId,
    ) -> Result<T, RewriteError> {
        let mut attempts = Vec::new();
        for backend in &self.backends {
            let result = backend
                .open(repo)
                .map_err(|source| RewriteError::BackendUnavailable {
                    backend: backend.name().to_string(),
                    source,
                })
                .and_then(|mut session| f(session.as_mut()));
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => attempts.push(FailedAttempt {
                    backend: backend.name().to_string(),
                    error: err,
                }),
            }
        }
        Err(RewriteError::Exhausted { attempts })
    }
}

/// Resolve the branch and list its commits.
fn read_history(session: &mut dyn Session, branch: &str) -> Result<Vec<Commit>, RewriteError> {
    session
        .resolve_branch(branch)
        .map_err(|e| RewriteError::from_resolve(branch, e))?;
    session
        .list_commits(branch)
        .map_err(|source| RewriteError::Backend {
            operation: "list commits",
            source,
        })
}

/// One complete rewrite on one backend.
#[instrument(skip_all, fields(backend = backend.name(), repo = %repo, branch = %branch))]
fn attempt(
    backend: &dyn Backend,
    repo: &RepoId,
    branch: &str,
    remove: &[String],
    options: &RewriteOptions,
    started: Instant,
) -> Result<RewriteResult, RewriteError> {
    let mut session = backend
        .open(repo)
        .map_err(|source| RewriteError::BackendUnavailable {
            backend: backend.name().to_string(),
            source,
        })?;
    let session = session.as_mut();

    let branch_ref = session
        .resolve_branch(branch)
        .map_err(|e| RewriteError::from_resolve(branch, e))?;
    let history = session
        .list_commits(branch)
        .map_err(|source| RewriteError::Backend {
            operation: "list commits",
            source,
        })?;
    let plan =
        RewritePlan::compute(&history, remove).map_err(|e| RewriteError::from_plan(branch, e))?;
    let total = plan.steps.len();
    tracing::info!(
        old_tip = %branch_ref.target.short(),
        keep = plan.keep.len(),
        remove = plan.removed.len(),
        steps = total,
        base = %plan.base.id.short(),
        "planned rewrite"
    );

    options.checkpoint(started, 0)?;

    let base = if plan.reroot_base {
        tracing::debug!(base = %plan.base.id.short(), "recreating base without parents");
        session
            .create_commit(&plan.base, None, None)
            .map_err(|source| RewriteError::Replay {
                commit: plan.base.id.clone(),
                completed: 0,
                total,
                source,
            })?
            .id
    } else {
        plan.base.id.clone()
    };

    let temp_name = temp_ref_name();
    let temp = session
        .create_branch(&temp_name, &base)
        .map_err(|source| RewriteError::TempRefCreation {
            name: temp_name.clone(),
            source,
        })?;
    tracing::info!(temp_ref = %temp.name, "staging on temporary ref");
    let mut staged = TempRef::new(session, temp);

    let mut tip = base;
    for (completed, step) in plan.steps.iter().enumerate() {
        options.checkpoint(started, completed)?;

        let replay_failed = |source| RewriteError::Replay {
            commit: step.commit.id.clone(),
            completed,
            total,
            source,
        };
        let replayed = staged
            .session()
            .create_commit(&step.commit, Some(&tip), step.mainline)
            .map_err(replay_failed)?;
        staged.advance(&replayed.id).map_err(|e| match e {
            BackendError::ConcurrentUpdate {
                name,
                expected,
                actual,
            } => RewriteError::ConcurrentUpdate {
                name,
                expected,
                actual,
            },
            other => replay_failed(other),
        })?;
        tracing::debug!(
            step = completed + 1,
            of = total,
            original = %step.commit.id.short(),
            replayed = %replayed.id.short(),
            "replayed commit"
        );
        tip = replayed.id;
    }

    options.checkpoint(started, total)?;

    let staged_ref = staged.handle.clone();
    staged
        .session()
        .persist(&staged_ref)
        .map_err(|source| RewriteError::Backend {
            operation: "persist temporary ref",
            source,
        })?;

    if let Err(source) = staged.session().force_update(&branch_ref, &tip) {
        let kept = staged.keep();
        tracing::error!(
            temp_ref = %kept.name,
            temp_tip = %kept.target,
            error = %source,
            "publishing failed, temporary ref preserved for recovery"
        );
        return Err(RewriteError::FinalUpdate {
            branch: branch.to_string(),
            temp_ref: kept.name,
            temp_tip: kept.target,
            source,
        });
    }
    drop(staged);

    Ok(RewriteResult {
        backend: backend.name().to_string(),
        old_tip: branch_ref.target,
        new_tip: tip,
        removed: plan.removed.into_iter().map(|c| c.id).collect(),
        replayed: total,
    })
}

/// The temporary ref of an in-flight rewrite, deleted when dropped.
///
/// Deletion failures are logged and swallowed: by the time this guard is
/// dropped the outcome of the rewrite is already decided.
struct TempRef<'s> {
    session: &'s mut dyn Session,
    handle: RefHandle,
    armed: bool,
}

impl<'s> TempRef<'s> {
    fn new(session: &'s mut dyn Session, handle: RefHandle) -> Self {
        Self {
            session,
            handle,
            armed: true,
        }
    }

    fn session(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    fn advance(&mut self, to: &CommitId) -> Result<(), BackendError> {
        self.handle = self.session.force_update(&self.handle, to)?;
        Ok(())
    }

    /// Leave the ref in place and return it.
    fn keep(mut self) -> RefHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for TempRef<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.session.delete_ref(&self.handle) {
            Ok(()) => tracing::debug!(temp_ref = %self.handle.name, "deleted temporary ref"),
            Err(err) => tracing::warn!(
                temp_ref = %self.handle.name,
                error = %err,
                "failed to delete temporary ref"
            ),
        }
    }
}

/// One backend's failure, kept for the aggregate error.
#[derive(Debug)]
pub struct FailedAttempt {
    pub backend: String,
    pub error: RewriteError,
}

/// Errors from rewriting a branch.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("branch '{branch}' not found")]
    BranchNotFound { branch: String },

    #[error("removing these commits would leave '{branch}' empty")]
    EmptyHistory { branch: String },

    #[error("none of the selected commits are on '{branch}'")]
    NothingToRemove { branch: String },

    #[error("commits not found on '{branch}': {}", .ids.join(", "))]
    UnknownCommits { branch: String, ids: Vec<String> },

    #[error("'{selector}' matches {} commits on '{branch}'", .candidates.len())]
    AmbiguousCommit {
        branch: String,
        selector: String,
        candidates: Vec<CommitId>,
    },

    #[error("could not create temporary ref '{name}'")]
    TempRefCreation {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("replaying {commit} failed after {completed} of {total} steps")]
    Replay {
        commit: CommitId,
        completed: usize,
        total: usize,
        #[source]
        source: BackendError,
    },

    #[error("ref '{name}' was moved concurrently (expected {expected}, found {actual})")]
    ConcurrentUpdate {
        name: String,
        expected: CommitId,
        actual: CommitId,
    },

    #[error(
        "history was rebuilt but '{branch}' could not be updated; \
         the result is preserved on '{temp_ref}' at {temp_tip}"
    )]
    FinalUpdate {
        branch: String,
        temp_ref: String,
        temp_tip: CommitId,
        #[source]
        source: BackendError,
    },

    #[error("backend '{backend}' is unavailable")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("{operation} failed")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("cancelled after {completed} replay steps")]
    Cancelled { completed: usize },

    #[error("deadline of {limit:?} exceeded after {completed} replay steps")]
    DeadlineExceeded { limit: Duration, completed: usize },

    #[error("all backends failed: {}", summarize(.attempts))]
    Exhausted { attempts: Vec<FailedAttempt> },
}

impl RewriteError {
    /// Errors that another backend cannot fix, or where trying one would be
    /// unsafe. These end the fallback chain immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RewriteError::EmptyHistory { .. }
                | RewriteError::NothingToRemove { .. }
                | RewriteError::UnknownCommits { .. }
                | RewriteError::AmbiguousCommit { .. }
                | RewriteError::FinalUpdate { .. }
                | RewriteError::Cancelled { .. }
                | RewriteError::DeadlineExceeded { .. }
        )
    }

    fn from_plan(branch: &str, err: PlanError) -> Self {
        let branch = branch.to_string();
        match err {
            PlanError::NothingToRemove => RewriteError::NothingToRemove { branch },
            PlanError::EmptyHistory => RewriteError::EmptyHistory { branch },
            PlanError::UnknownCommits(ids) => RewriteError::UnknownCommits { branch, ids },
            PlanError::Ambiguous {
                selector,
                candidates,
            } => RewriteError::AmbiguousCommit {
                branch,
                selector,
                candidates,
            },
        }
    }

    fn from_resolve(branch: &str, err: BackendError) -> Self {
        match err {
            BackendError::RefNotFound(_) => RewriteError::BranchNotFound {
                branch: branch.to_string(),
            },
            source => RewriteError::Backend {
                operation: "resolve branch",
                source,
            },
        }
    }
}

fn summarize(attempts: &[FailedAttempt]) -> String {
    if attempts.is_empty() {
        return "no backends configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.backend, error_chain(&a.error)))
        .collect::<Vec<_>>()
        .join("; ")
}

/// An error and all of its sources, joined with `: `.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
