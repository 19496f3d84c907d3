//! Merge one branch into another through the hosted API.

use crate::backend::BackendError;
use crate::hosted::HostedClient;
use crate::model::CommitId;

/// What happened when merging `head` into `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// `base` already contains every commit of `head`.
    AlreadyMerged,

    Merged { sha: CommitId },

    /// The forge refused to merge automatically.
    Conflict { message: String },
}

/// Merge `head` into `base`, using `message` or a default merge message.
#[tracing::instrument(skip(client, message))]
pub fn merge_branches(
    client: &HostedClient,
    base: &str,
    head: &str,
    message: Option<&str>,
) -> Result<MergeOutcome, BackendError> {
    let comparison = client.compare(base, head)?;
    tracing::debug!(
        status = %comparison.status,
        ahead_by = comparison.ahead_by,
        behind_by = comparison.behind_by,
        "compared branches"
    );
    if comparison.ahead_by == 0 {
        return Ok(MergeOutcome::AlreadyMerged);
    }

    let message = message
        .map(str::to_string)
        .unwrap_or_else(|| default_message(base, head));
    match client.merge(base, head, &message) {
        Ok(Some(sha)) => {
            tracing::info!(sha = %sha.short(), "merged");
            Ok(MergeOutcome::Merged { sha })
        }
        Ok(None) => Ok(MergeOutcome::AlreadyMerged),
        Err(BackendError::Conflict { detail, .. }) => {
            tracing::warn!(detail = %detail, "merge conflict");
            Ok(MergeOutcome::Conflict { message: detail })
        }
        Err(e) => Err(e),
    }
}

fn default_message(base: &str, head: &str) -> String {
    format!("Merge {head} into {base}")
}
