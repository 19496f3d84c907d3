//! The version-control capability interface.
//!
//! A [`Backend`] is a factory for [`Session`]s. Each rewrite attempt opens its
//! own session, so per-attempt state (an HTTP agent, a private clone) never
//! leaks between attempts or between concurrent operations.

use thiserror::Error;

use crate::model::{Commit, CommitId, RefHandle, RepoId};

/// A pluggable implementation of the version-control primitives.
pub trait Backend: Send + Sync {
    /// Short name used in logs and aggregate errors.
    fn name(&self) -> &str;

    /// Open an isolated session against `repo`.
    fn open(&self, repo: &RepoId) -> Result<Box<dyn Session>, BackendError>;
}

/// Operations on one repository, scoped to one rewrite attempt.
pub trait Session {
    /// Read the commit a branch currently points at.
    fn resolve_branch(&mut self, branch: &str) -> Result<RefHandle, BackendError>;

    /// Create a new branch pointing at `at`.
    fn create_branch(&mut self, name: &str, at: &CommitId) -> Result<RefHandle, BackendError>;

    /// Move `handle` to `to` unconditionally, returning the updated handle.
    ///
    /// Implementations that can observe the live ref fail with
    /// [`BackendError::ConcurrentUpdate`] when it no longer matches
    /// `handle.target`.
    fn force_update(&mut self, handle: &RefHandle, to: &CommitId)
    -> Result<RefHandle, BackendError>;

    /// All commits reachable from `branch`, newest first.
    fn list_commits(&mut self, branch: &str) -> Result<Vec<Commit>, BackendError>;

    fn get_commit(&mut self, id: &CommitId) -> Result<Commit, BackendError>;

    /// Recreate `original` on top of `parent`, or as a root commit when
    /// `parent` is `None`.
    ///
    /// `mainline` is the 1-based parent of a merge commit whose side is
    /// replayed; it is `None` for ordinary commits.
    fn create_commit(
        &mut self,
        original: &Commit,
        parent: Option<&CommitId>,
        mainline: Option<usize>,
    ) -> Result<Commit, BackendError>;

    /// Delete a branch. Deleting a branch that is already gone succeeds.
    fn delete_ref(&mut self, handle: &RefHandle) -> Result<(), BackendError>;

    /// Make a branch created in this session visible outside it, so that it
    /// outlives the session. Sessions whose branches already live on the
    /// remote have nothing to do.
    fn persist(&mut self, handle: &RefHandle) -> Result<(), BackendError> {
        let _ = handle;
        Ok(())
    }
}

/// Errors from a backend primitive.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("ref '{0}' not found")]
    RefNotFound(String),

    #[error("ref '{name}' moved from {expected} to {actual}")]
    ConcurrentUpdate {
        name: String,
        expected: CommitId,
        actual: CommitId,
    },

    #[error("commit {commit} does not apply cleanly: {detail}")]
    Conflict { commit: CommitId, detail: String },

    #[error("{operation} rejected{}: {message}", status_suffix(.status))]
    Rejected {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}
