//! In-memory repository and backend with fault injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use excise::{
    Backend, BackendError, CancellationToken, Commit, CommitId, RefHandle, RepoId, Session,
    Signature,
};

#[derive(Default)]
struct State {
    commits: HashMap<CommitId, (usize, Commit)>,
    refs: BTreeMap<String, CommitId>,
    seq: usize,
}

/// A repository shared by every backend built on it.
#[derive(Clone, Default)]
pub struct MemoryRemote(Arc<Mutex<State>>);

impl MemoryRemote {
    fn state(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    /// Build `main` as a linear chain, oldest first.
    pub fn linear(names: &[&str]) -> Self {
        let remote = Self::default();
        let mut parent: Option<&str> = None;
        for name in names {
            remote.add(name, parent.as_slice());
            parent = Some(*name);
        }
        if let Some(tip) = parent {
            remote.set_ref("main", tip);
        }
        remote
    }

    /// Add a commit whose tree and message are derived from `name`.
    pub fn add(&self, name: &str, parents: &[&str]) {
        let commit = Commit {
            id: CommitId::new(name),
            parents: parents.iter().map(|p| CommitId::new(*p)).collect(),
            tree: format!("tree-{name}"),
            message: name.to_string(),
            author: signature(),
        };
        self.insert(commit);
    }

    fn insert(&self, commit: Commit) {
        let mut state = self.state();
        state.seq += 1;
        let seq = state.seq;
        state.commits.insert(commit.id.clone(), (seq, commit));
    }

    pub fn set_ref(&self, name: &str, target: &str) {
        self.state()
            .refs
            .insert(name.to_string(), CommitId::new(target));
    }

    pub fn branch(&self, name: &str) -> Option<CommitId> {
        self.state().refs.get(name).cloned()
    }

    pub fn ref_names(&self) -> Vec<String> {
        self.state().refs.keys().cloned().collect()
    }

    pub fn temp_refs(&self) -> Vec<String> {
        self.ref_names()
            .into_iter()
            .filter(|n| n.starts_with("temp-remove-commits-"))
            .collect()
    }

    pub fn commit(&self, id: &CommitId) -> Commit {
        self.state().commits[id].1.clone()
    }

    /// Every commit reachable from `tip`, newest first.
    pub fn walk(&self, tip: &CommitId) -> Vec<Commit> {
        let state = self.state();
        let mut seen = HashSet::new();
        let mut stack = vec![tip.clone()];
        let mut found = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some((seq, commit)) = state.commits.get(&id) {
                stack.extend(commit.parents.iter().cloned());
                found.push((*seq, commit.clone()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, c)| c).collect()
    }

    /// Messages of the commits on `branch`, newest first.
    pub fn messages(&self, branch: &str) -> Vec<String> {
        let tip = self.branch(branch).expect("branch exists");
        self.walk(&tip).into_iter().map(|c| c.message).collect()
    }
}

fn signature() -> Signature {
    Signature {
        name: "Ada".to_string(),
        email: "ada@example.com".to_string(),
        date: "2024-01-01T00:00:00Z".to_string(),
    }
}

/// Failures to inject into one backend.
#[derive(Clone, Default)]
pub struct Faults {
    pub fail_open: bool,
    pub fail_create_branch: bool,
    /// Fail the n-th replay (1-based)
    pub fail_replay_at: Option<usize>,
    /// Fail the force-update of any branch that is not a temporary ref
    pub fail_publish: bool,
    pub fail_delete: bool,
    /// Cancel this token during the n-th replay (1-based)
    pub cancel_at: Option<(usize, CancellationToken)>,
    /// Move `main` to this commit during the first replay
    pub race_main_to: Option<String>,
}

/// Counters observed by tests.
#[derive(Default)]
pub struct Calls {
    pub opens: usize,
    pub replays: usize,
}

pub struct MemoryBackend {
    name: String,
    remote: MemoryRemote,
    faults: Faults,
    calls: Arc<Mutex<Calls>>,
}

impl MemoryBackend {
    pub fn new(name: &str, remote: &MemoryRemote) -> Self {
        Self::with_faults(name, remote, Faults::default())
    }

    pub fn with_faults(name: &str, remote: &MemoryRemote, faults: Faults) -> Self {
        Self {
            name: name.to_string(),
            remote: remote.clone(),
            faults,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<Calls>> {
        self.calls.clone()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, _repo: &RepoId) -> Result<Box<dyn Session>, BackendError> {
        self.calls.lock().unwrap().opens += 1;
        if self.faults.fail_open {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(Box::new(MemorySession {
            name: self.name.clone(),
            remote: self.remote.clone(),
            faults: self.faults.clone(),
            calls: self.calls.clone(),
            created: 0,
        }))
    }
}

struct MemorySession {
    name: String,
    remote: MemoryRemote,
    faults: Faults,
    calls: Arc<Mutex<Calls>>,
    created: usize,
}

impl Session for MemorySession {
    fn resolve_branch(&mut self, branch: &str) -> Result<RefHandle, BackendError> {
        self.remote
            .branch(branch)
            .map(|target| RefHandle::new(branch, target))
            .ok_or_else(|| BackendError::RefNotFound(branch.to_string()))
    }

    fn create_branch(&mut self, name: &str, at: &CommitId) -> Result<RefHandle, BackendError> {
        if self.faults.fail_create_branch {
            return Err(BackendError::Rejected {
                operation: "create ref".to_string(),
                status: Some(403),
                message: "Resource not accessible by integration".to_string(),
            });
        }
        self.remote.set_ref(name, at.as_str());
        Ok(RefHandle::new(name, at.clone()))
    }

    fn force_update(
        &mut self,
        handle: &RefHandle,
        to: &CommitId,
    ) -> Result<RefHandle, BackendError> {
        let is_temp = handle.name.starts_with("temp-remove-commits-");
        if self.faults.fail_publish && !is_temp {
            return Err(BackendError::Unavailable("update ref timed out".to_string()));
        }
        let live = self
            .remote
            .branch(&handle.name)
            .ok_or_else(|| BackendError::RefNotFound(handle.name.clone()))?;
        if live != handle.target {
            return Err(BackendError::ConcurrentUpdate {
                name: handle.name.clone(),
                expected: handle.target.clone(),
                actual: live,
            });
        }
        self.remote.set_ref(&handle.name, to.as_str());
        Ok(RefHandle::new(handle.name.clone(), to.clone()))
    }

    fn list_commits(&mut self, branch: &str) -> Result<Vec<Commit>, BackendError> {
        let tip = self
            .remote
            .branch(branch)
            .ok_or_else(|| BackendError::RefNotFound(branch.to_string()))?;
        Ok(self.remote.walk(&tip))
    }

    fn get_commit(&mut self, id: &CommitId) -> Result<Commit, BackendError> {
        Ok(self.remote.commit(id))
    }

    fn create_commit(
        &mut self,
        original: &Commit,
        parent: Option<&CommitId>,
        _mainline: Option<usize>,
    ) -> Result<Commit, BackendError> {
        if parent.is_some() {
            let replay = {
                let mut calls = self.calls.lock().unwrap();
                calls.replays += 1;
                calls.replays
            };
            if self.faults.fail_replay_at == Some(replay) {
                return Err(BackendError::Unavailable("502 Bad Gateway".to_string()));
            }
            if let Some((at, token)) = &self.faults.cancel_at {
                if *at == replay {
                    token.cancel();
                }
            }
            if replay == 1 {
                if let Some(target) = &self.faults.race_main_to {
                    self.remote.set_ref("main", target);
                }
            }
        }

        self.created += 1;
        let commit = Commit {
            id: CommitId::new(format!("{}-{}-{}", self.name, original.id, self.created)),
            parents: parent.cloned().into_iter().collect(),
            tree: original.tree.clone(),
            message: original.message.clone(),
            author: original.author.clone(),
        };
        self.remote.insert(commit.clone());
        Ok(commit)
    }

    fn delete_ref(&mut self, handle: &RefHandle) -> Result<(), BackendError> {
        if self.faults.fail_delete {
            return Err(BackendError::Unavailable("delete ref timed out".to_string()));
        }
        self.remote.state().refs.remove(&handle.name);
        Ok(())
    }
}

pub fn repo() -> RepoId {
    "octo/widgets".parse().unwrap()
}

pub fn sel(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
