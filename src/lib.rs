//! Excise: remove commits from a branch's history.
//!
//! The retained commits are replayed oldest to newest onto a temporary
//! branch, and the real branch is force-updated to the result in one step.
//! Replay can go through a forge's REST API or through `git` in a private
//! clone; backends are tried in order until one succeeds.
//!
//! # Architecture
//!
//! - **Plan**: Decide which commits survive and the replay order
//! - **Rewrite**: Stage, replay, publish, and clean up, with backend fallback
//! - **Backend**: The version-control primitives, with hosted and local variants
//! - **Merge**: Merge one branch into another through the hosted API

mod backend;
mod config;
mod git;
mod hosted;
mod local;
mod merge;
mod model;
mod plan;
mod retry;
mod rewrite;

pub use backend::{Backend, BackendError, Session};
pub use config::{BackendKind, Config, ConfigError, DEFAULT_CONFIG_FILE};
pub use hosted::{CommitPages, Comparison, HostedApiBackend, HostedClient, HostedConfig};
pub use local::{ConflictPolicy, LocalCliBackend, LocalConfig};
pub use merge::{MergeOutcome, merge_branches};
pub use model::{Commit, CommitId, ParseRepoIdError, RefHandle, RepoId, Signature, temp_ref_name};
pub use plan::{PlanError, ReplayStep, RewritePlan};
pub use retry::RetryPolicy;
pub use rewrite::{
    FailedAttempt, HistoryRewriter, RewriteError, RewriteOptions, RewriteResult, error_chain,
};

pub use tokio_util::sync::CancellationToken;
