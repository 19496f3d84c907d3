//! Backend that talks to a GitHub-compatible REST API.
//!
//! No working directory is involved: refs and commit objects are created
//! remotely through the git data endpoints.

use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::{Backend, BackendError, Session};
use crate::model::{Commit, CommitId, RefHandle, RepoId, Signature};
use crate::retry::RetryPolicy;

const PER_PAGE: usize = 100;

/// Settings for [`HostedApiBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    pub api_url: String,

    /// Environment variable holding the bearer token
    pub token_env: String,

    pub timeout_secs: u64,

    pub user_agent: String,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            timeout_secs: 30,
            user_agent: concat!("excise/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct HostedApiBackend {
    config: HostedConfig,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HostedApiBackend {
    pub fn new(config: HostedConfig, token: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            config,
            token,
            retry,
        }
    }

    /// A client bound to one repository.
    pub fn client(&self, repo: &RepoId) -> HostedClient {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .user_agent(&self.config.user_agent)
            .build();
        HostedClient {
            agent,
            base: self.config.api_url.trim_end_matches('/').to_string(),
            repo: repo.clone(),
            token: self.token.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl Backend for HostedApiBackend {
    fn name(&self) -> &str {
        "hosted"
    }

    fn open(&self, repo: &RepoId) -> Result<Box<dyn Session>, BackendError> {
        Ok(Box::new(self.client(repo)))
    }
}

/// Blocking REST client for one repository.
pub struct HostedClient {
    agent: ureq::Agent,
    base: String,
    repo: RepoId,
    token: Option<String>,
    retry: RetryPolicy,
}

/// Result of comparing two branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    /// `ahead`, `behind`, `diverged` or `identical`
    pub status: String,

    /// Commits on head that base lacks
    pub ahead_by: u64,

    pub behind_by: u64,

    /// The commits head is ahead by, oldest first
    pub commits: Vec<Commit>,
}

impl HostedClient {
    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.base, self.repo.owner, self.repo.name, path)
    }

    /// Send one request through the retry policy.
    fn send(
        &self,
        operation: &str,
        method: &str,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ureq::Response, BackendError> {
        self.retry.run(operation, || {
            let mut request = self
                .agent
                .request(method, url)
                .set("Accept", "application/vnd.github+json")
                .set("X-GitHub-Api-Version", "2022-11-28");
            if let Some(token) = &self.token {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
            tracing::trace!(operation, method, url, "api request");
            let result = match body {
                Some(body) => request.send_json(body.clone()),
                None => request.call(),
            };
            result.map_err(|e| classify(operation, e))
        })
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: &str,
        url: &str,
        body: Option<&Value>,
    ) -> Result<T, BackendError> {
        let response = self.send(operation, method, url, body)?;
        response
            .into_json()
            .map_err(|e| BackendError::Unavailable(format!("{operation}: malformed response: {e}")))
    }

    fn git_ref(&self, branch: &str) -> Result<CommitId, BackendError> {
        let url = self.repo_url(&format!("/git/ref/heads/{branch}"));
        match self.send_json::<RefObject>("get ref", "GET", &url, None) {
            Ok(r) => Ok(CommitId::new(r.object.sha)),
            Err(BackendError::Rejected {
                status: Some(404), ..
            }) => Err(BackendError::RefNotFound(branch.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Lazily walk the commits reachable from `branch`, one page at a time.
    pub fn commits(&self, branch: &str) -> CommitPages<'_> {
        let url = format!(
            "{}?sha={}&per_page={PER_PAGE}",
            self.repo_url("/commits"),
            branch
        );
        CommitPages {
            client: self,
            branch: branch.to_string(),
            next: Some(url),
            first: true,
        }
    }

    /// Compare `base...head`.
    pub fn compare(&self, base: &str, head: &str) -> Result<Comparison, BackendError> {
        let url = self.repo_url(&format!("/compare/{base}...{head}"));
        let wire: WireComparison = self.send_json("compare", "GET", &url, None)?;
        Ok(Comparison {
            status: wire.status,
            ahead_by: wire.ahead_by,
            behind_by: wire.behind_by,
            commits: wire.commits.into_iter().map(Commit::from).collect(),
        })
    }

    /// Merge `head` into `base`. Returns the merge commit, or `None` when there
    /// was nothing to merge.
    pub fn merge(
        &self,
        base: &str,
        head: &str,
        message: &str,
    ) -> Result<Option<CommitId>, BackendError> {
        let url = self.repo_url("/merges");
        let body = json!({ "base": base, "head": head, "commit_message": message });
        match self.send("merge", "POST", &url, Some(&body)) {
            Ok(response) if response.status() == 204 => Ok(None),
            Ok(response) => {
                let merged: ShaOnly = response.into_json().map_err(|e| {
                    BackendError::Unavailable(format!("merge: malformed response: {e}"))
                })?;
                Ok(Some(CommitId::new(merged.sha)))
            }
            Err(BackendError::Rejected {
                status: Some(409),
                message,
                ..
            }) => Err(BackendError::Conflict {
                commit: CommitId::new(head),
                detail: message,
            }),
            Err(e) => Err(e),
        }
    }
}

impl Session for HostedClient {
    fn resolve_branch(&mut self, branch: &str) -> Result<RefHandle, BackendError> {
        Ok(RefHandle::new(branch, self.git_ref(branch)?))
    }

    fn create_branch(&mut self, name: &str, at: &CommitId) -> Result<RefHandle, BackendError> {
        let url = self.repo_url("/git/refs");
        let body = json!({ "ref": format!("refs/heads/{name}"), "sha": at.as_str() });
        let created: RefObject = self.send_json("create ref", "POST", &url, Some(&body))?;
        Ok(RefHandle::new(name, CommitId::new(created.object.sha)))
    }

    fn force_update(
        &mut self,
        handle: &RefHandle,
        to: &CommitId,
    ) -> Result<RefHandle, BackendError> {
        let live = self.git_ref(&handle.name)?;
        if live != handle.target {
            return Err(BackendError::ConcurrentUpdate {
                name: handle.name.clone(),
                expected: handle.target.clone(),
                actual: live,
            });
        }
        let url = self.repo_url(&format!("/git/refs/heads/{}", handle.name));
        let body = json!({ "sha": to.as_str(), "force": true });
        let updated: RefObject = self.send_json("update ref", "PATCH", &url, Some(&body))?;
        Ok(RefHandle::new(
            handle.name.clone(),
            CommitId::new(updated.object.sha),
        ))
    }

    fn list_commits(&mut self, branch: &str) -> Result<Vec<Commit>, BackendError> {
        let mut commits = Vec::new();
        for page in self.commits(branch) {
            commits.extend(page?);
        }
        Ok(commits)
    }

    fn get_commit(&mut self, id: &CommitId) -> Result<Commit, BackendError> {
        let url = self.repo_url(&format!("/git/commits/{id}"));
        let commit: GitCommit = self.send_json("get commit", "GET", &url, None)?;
        Ok(commit.into())
    }

    fn create_commit(
        &mut self,
        original: &Commit,
        parent: Option<&CommitId>,
        _mainline: Option<usize>,
    ) -> Result<Commit, BackendError> {
        let url = self.repo_url("/git/commits");
        let parents: Vec<&str> = parent.map(|p| p.as_str()).into_iter().collect();
        let mut body = json!({
            "message": original.message,
            "tree": original.tree,
            "parents": parents,
        });
        if !original.author.date.is_empty() {
            body["author"] = json!({
                "name": original.author.name,
                "email": original.author.email,
                "date": original.author.date,
            });
        }
        let created: GitCommit = self.send_json("create commit", "POST", &url, Some(&body))?;
        Ok(created.into())
    }

    fn delete_ref(&mut self, handle: &RefHandle) -> Result<(), BackendError> {
        let url = self.repo_url(&format!("/git/refs/heads/{}", handle.name));
        match self.send("delete ref", "DELETE", &url, None) {
            Ok(_) => Ok(()),
            Err(BackendError::Rejected {
                status: Some(404 | 422),
                ..
            }) => {
                tracing::debug!(branch = %handle.name, "ref already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Iterator over pages of a branch's commit listing.
///
/// Each page is fetched on demand. The walk cannot be resumed once dropped;
/// call [`HostedClient::commits`] again to start over.
pub struct CommitPages<'a> {
    client: &'a HostedClient,
    branch: String,
    next: Option<String>,
    first: bool,
}

impl Iterator for CommitPages<'_> {
    type Item = Result<Vec<Commit>, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = self.next.take()?;
        if !self.first {
            thread::sleep(self.client.retry.page_delay());
        }
        self.first = false;

        let response = match self.client.send("list commits", "GET", &url, None) {
            Ok(response) => response,
            Err(BackendError::Rejected {
                status: Some(404 | 422),
                ..
            }) => return Some(Err(BackendError::RefNotFound(self.branch.clone()))),
            Err(e) => return Some(Err(e)),
        };
        self.next = response.header("link").and_then(next_link);
        let page: Result<Vec<ListedCommit>, _> = response.into_json();
        Some(
            page.map(|commits| commits.into_iter().map(Commit::from).collect())
                .map_err(|e| {
                    BackendError::Unavailable(format!("list commits: malformed response: {e}"))
                }),
        )
    }
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        is_next.then(|| url.to_string())
    })
}

/// Map a failed request to a backend error.
fn classify(operation: &str, err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(operation, status, &body)
        }
        ureq::Error::Transport(transport) => {
            BackendError::Unavailable(format!("{operation}: {transport}"))
        }
    }
}

fn classify_status(operation: &str, status: u16, body: &str) -> BackendError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let rate_limited = status == 403 && message.to_ascii_lowercase().contains("rate limit");
    if status == 429 || status >= 500 || rate_limited {
        BackendError::Unavailable(format!("{operation} ({status}): {message}"))
    } else {
        BackendError::Rejected {
            operation: operation.to_string(),
            status: Some(status),
            message,
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    object: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct WireSignature {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    date: String,
}

impl From<WireSignature> for Signature {
    fn from(s: WireSignature) -> Self {
        Signature {
            name: s.name,
            email: s.email,
            date: s.date,
        }
    }
}

/// Shape of the git data API commit object.
#[derive(Debug, Deserialize)]
struct GitCommit {
    sha: String,
    tree: ShaOnly,
    message: String,
    author: WireSignature,
    #[serde(default)]
    parents: Vec<ShaOnly>,
}

impl From<GitCommit> for Commit {
    fn from(c: GitCommit) -> Self {
        Commit {
            id: CommitId::new(c.sha),
            parents: c.parents.into_iter().map(|p| CommitId::new(p.sha)).collect(),
            tree: c.tree.sha,
            message: c.message,
            author: c.author.into(),
        }
    }
}

/// Shape of an entry in the commit listing endpoint.
#[derive(Debug, Deserialize)]
struct ListedCommit {
    sha: String,
    commit: ListedCommitDetail,
    #[serde(default)]
    parents: Vec<ShaOnly>,
}

#[derive(Debug, Deserialize)]
struct ListedCommitDetail {
    message: String,
    tree: ShaOnly,
    author: WireSignature,
}

impl From<ListedCommit> for Commit {
    fn from(c: ListedCommit) -> Self {
        Commit {
            id: CommitId::new(c.sha),
            parents: c.parents.into_iter().map(|p| CommitId::new(p.sha)).collect(),
            tree: c.commit.tree.sha,
            message: c.commit.message,
            author: c.commit.author.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireComparison {
    status: String,
    ahead_by: u64,
    behind_by: u64,
    #[serde(default)]
    commits: Vec<ListedCommit>,
}
