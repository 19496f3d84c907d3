//! Commit and ref types shared by every backend.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Shortest abbreviated identifier accepted when selecting commits.
pub const MIN_ABBREV_LEN: usize = 4;

/// Content hash of a commit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first seven characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }

    /// Check whether `selector` names this commit, either in full or as an
    /// abbreviation of at least [`MIN_ABBREV_LEN`] characters.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        if selector.len() == self.0.len() {
            return self.0.eq_ignore_ascii_case(selector);
        }
        selector.len() >= MIN_ABBREV_LEN
            && selector.len() < self.0.len()
            && self.0[..selector.len()].eq_ignore_ascii_case(selector)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Author identity and timestamp of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// RFC 3339 timestamp as reported by the backend
    pub date: String,
}

/// An immutable commit node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub id: CommitId,

    /// Ordered parents; more than one marks a merge commit
    pub parents: Vec<CommitId>,

    /// Tree object the commit snapshots
    pub tree: String,

    pub message: String,

    pub author: Signature,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// A repository on the hosting service, written `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoId {
    type Err = ParseRepoIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches(".git");
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [owner, name] if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => Err(ParseRepoIdError(s.to_string())),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected a repository of the form 'owner/name', got '{0}'")]
pub struct ParseRepoIdError(String);

/// A branch name together with the commit it was last seen pointing at.
///
/// The target is a snapshot: the hosted backend compares it against the
/// live ref before force-updating, so a handle that has gone stale makes the
/// update fail instead of clobbering someone else's push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefHandle {
    pub name: String,
    pub target: CommitId,
}

impl RefHandle {
    pub fn new(name: impl Into<String>, target: CommitId) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// Name for the scratch branch that stages a rewritten chain.
///
/// The timestamp keeps names readable in a branch listing; the random suffix
/// keeps two invocations in the same second apart.
pub fn temp_ref_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("temp-remove-commits-{secs}-{}", &nonce[..8])
}
