//! Work out which commits survive a removal and in what order to replay them.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::model::{Commit, CommitId};

/// One commit to recreate on top of the chain built so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStep {
    pub commit: Commit,

    /// For a merge commit, the 1-based position of its first retained parent.
    /// The replayed commit always has a single parent; this only says which
    /// side of the merge its changes are taken against.
    pub mainline: Option<usize>,
}

/// The retained history of a branch after removing some commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    /// Retained commits, newest first
    pub keep: Vec<Commit>,

    /// Commits selected for removal, newest first
    pub removed: Vec<Commit>,

    /// Newest retained commit with no removed ancestor. It and everything
    /// older is kept as-is; the rebuilt chain starts on top of it.
    pub base: Commit,

    /// No retained commit is free of removed ancestors, so the oldest
    /// retained commit is recreated without parents and used as the base
    pub reroot_base: bool,

    /// Retained commits newer than the base, oldest first
    pub steps: Vec<ReplayStep>,
}

impl RewritePlan {
    /// Compute the plan for removing `selectors` from `history` (newest first).
    ///
    /// Selectors are full commit ids or unambiguous abbreviations.
    pub fn compute(history: &[Commit], selectors: &[String]) -> Result<Self, PlanError> {
        let mut remove: HashSet<CommitId> = HashSet::new();
        let mut unknown = Vec::new();
        for selector in selectors {
            let matches: Vec<&Commit> = history.iter().filter(|c| c.id.matches(selector)).collect();
            match matches.as_slice() {
                [] => unknown.push(selector.clone()),
                [commit] => {
                    remove.insert(commit.id.clone());
                }
                many => {
                    return Err(PlanError::Ambiguous {
                        selector: selector.clone(),
                        candidates: many.iter().map(|c| c.id.clone()).collect(),
                    });
                }
            }
        }

        if remove.is_empty() {
            return Err(PlanError::NothingToRemove);
        }
        if !unknown.is_empty() {
            return Err(PlanError::UnknownCommits(unknown));
        }

        let (removed, keep): (Vec<Commit>, Vec<Commit>) =
            history.iter().cloned().partition(|c| remove.contains(&c.id));
        if keep.is_empty() {
            return Err(PlanError::EmptyHistory);
        }

        // Retained commits listed after the oldest removed one are candidates
        // for an untouched prefix, provided no removed commit is behind them.
        let oldest_removed = history
            .iter()
            .rposition(|c| remove.contains(&c.id))
            .unwrap_or(0);
        let by_id: HashMap<&CommitId, &Commit> = history.iter().map(|c| (&c.id, c)).collect();
        let clean_base = history[oldest_removed..]
            .iter()
            .filter(|c| !remove.contains(&c.id))
            .find(|c| !reaches_any(c, &by_id, &remove));

        let (base, reroot_base) = match clean_base {
            Some(base) => (base.clone(), false),
            None => match keep.last() {
                Some(oldest) => (oldest.clone(), true),
                None => return Err(PlanError::EmptyHistory),
            },
        };

        let retained: HashSet<&CommitId> = keep.iter().map(|c| &c.id).collect();
        let newer: Vec<&Commit> = keep.iter().take_while(|c| c.id != base.id).collect();
        let steps = newer
            .into_iter()
            .rev()
            .map(|commit| ReplayStep {
                mainline: mainline_parent(commit, &retained),
                commit: commit.clone(),
            })
            .collect();

        Ok(Self {
            keep,
            removed,
            base,
            reroot_base,
            steps,
        })
    }
}

/// Whether any ancestor of `commit` within the listed history is in `remove`.
fn reaches_any(
    commit: &Commit,
    by_id: &HashMap<&CommitId, &Commit>,
    remove: &HashSet<CommitId>,
) -> bool {
    let mut seen = HashSet::new();
    let mut stack: Vec<&CommitId> = commit.parents.iter().collect();
    while let Some(id) = stack.pop() {
        if remove.contains(id) {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(parent) = by_id.get(id) {
            stack.extend(parent.parents.iter());
        }
    }
    false
}

fn mainline_parent(commit: &Commit, retained: &HashSet<&CommitId>) -> Option<usize> {
    if !commit.is_merge() {
        return None;
    }
    let position = commit
        .parents
        .iter()
        .position(|p| retained.contains(p))
        .unwrap_or(0);
    Some(position + 1)
}

/// Why a removal cannot be planned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("none of the selected commits are on the branch")]
    NothingToRemove,

    #[error("commits not found on the branch: {}", .0.join(", "))]
    UnknownCommits(Vec<String>),

    #[error("'{selector}' matches more than one commit")]
    Ambiguous {
        selector: String,
        candidates: Vec<CommitId>,
    },

    #[error("removing these commits would leave the branch empty")]
    EmptyHistory,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Signature;
    use pretty_assertions::assert_eq;

    fn commit(id: &str, parents: &[&str]) -> Commit {
        Commit {
            id: CommitId::new(id),
            parents: parents.iter().map(|p| CommitId::new(*p)).collect(),
            tree: format!("tree-{id}"),
            message: format!("commit {id}"),
            author: Signature {
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                date: "2024-01-01T00:00:00Z".to_string(),
            },
        }
    }

    /// `[D, C, B, A]`, newest first.
    fn linear() -> Vec<Commit> {
        vec![
            commit("dddd", &["cccc"]),
            commit("cccc", &["bbbb"]),
            commit("bbbb", &["aaaa"]),
            commit("aaaa", &[]),
        ]
    }

    fn ids(commits: impl IntoIterator<Item = Commit>) -> Vec<String> {
        commits.into_iter().map(|c| c.id.to_string()).collect()
    }

    fn sel(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn removing_a_middle_commit_keeps_the_older_prefix() {
        let plan = RewritePlan::compute(&linear(), &sel(&["cccc"])).unwrap();
        assert_eq!(ids(plan.keep.clone()), vec!["dddd", "bbbb", "aaaa"]);
        assert_eq!(ids(plan.removed.clone()), vec!["cccc"]);
        assert_eq!(plan.base.id.as_str(), "bbbb");
        assert!(!plan.reroot_base);
        assert_eq!(ids(plan.steps.iter().map(|s| s.commit.clone())), vec!["dddd"]);
    }

    #[test]
    fn replay_starts_above_the_oldest_removed_commit() {
        let plan = RewritePlan::compute(&linear(), &sel(&["dddd", "bbbb"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "aaaa");
        assert_eq!(ids(plan.steps.iter().map(|s| s.commit.clone())), vec!["cccc"]);
    }

    #[test]
    fn removing_everything_is_rejected() {
        let history = linear();
        let err = RewritePlan::compute(&history, &sel(&["aaaa", "bbbb", "cccc", "dddd"]))
            .unwrap_err();
        assert_eq!(err, PlanError::EmptyHistory);
    }

    #[test]
    fn selectors_absent_from_history_mean_nothing_to_do() {
        assert_eq!(
            RewritePlan::compute(&linear(), &sel(&["ffff"])).unwrap_err(),
            PlanError::NothingToRemove
        );
        assert_eq!(
            RewritePlan::compute(&linear(), &[]).unwrap_err(),
            PlanError::NothingToRemove
        );
    }

    #[test]
    fn partially_unknown_selection_is_rejected() {
        let err = RewritePlan::compute(&linear(), &sel(&["cccc", "ffff"])).unwrap_err();
        assert_eq!(err, PlanError::UnknownCommits(sel(&["ffff"])));
    }

    #[test]
    fn ambiguous_abbreviation_is_rejected() {
        let history = vec![commit("abcd1111", &["abcd2222"]), commit("abcd2222", &[])];
        let err = RewritePlan::compute(&history, &sel(&["abcd"])).unwrap_err();
        assert!(matches!(err, PlanError::Ambiguous { ref candidates, .. } if candidates.len() == 2));
    }

    #[test]
    fn removing_the_root_reroots_the_base() {
        let plan = RewritePlan::compute(&linear(), &sel(&["aaaa"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "bbbb");
        assert!(plan.reroot_base);
        assert_eq!(
            ids(plan.steps.iter().map(|s| s.commit.clone())),
            vec!["cccc", "dddd"]
        );
    }

    #[test]
    fn removing_the_tip_needs_no_replay() {
        let plan = RewritePlan::compute(&linear(), &sel(&["dddd"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "cccc");
        assert!(!plan.reroot_base);
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn base_behind_a_removed_commit_is_skipped_despite_listing_order() {
        // Clock skew lists cccc after its removed parent bbbb.
        let history = vec![
            commit("dddd", &["cccc"]),
            commit("bbbb", &["aaaa"]),
            commit("cccc", &["bbbb"]),
            commit("aaaa", &[]),
        ];
        let plan = RewritePlan::compute(&history, &sel(&["bbbb"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "aaaa");
        assert_eq!(
            ids(plan.steps.iter().map(|s| s.commit.clone())),
            vec!["cccc", "dddd"]
        );
    }

    #[test]
    fn single_survivor_needs_no_replay() {
        let history = vec![commit("bbbb", &["aaaa"]), commit("aaaa", &[])];
        let plan = RewritePlan::compute(&history, &sel(&["bbbb"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "aaaa");
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn merge_with_removed_side_uses_retained_parent_as_mainline() {
        // M merges X into B; X is removed.
        let history = vec![
            commit("mmmm", &["xxxx", "bbbb"]),
            commit("xxxx", &["aaaa"]),
            commit("bbbb", &["aaaa"]),
            commit("aaaa", &[]),
        ];
        let plan = RewritePlan::compute(&history, &sel(&["xxxx"])).unwrap();
        assert_eq!(plan.base.id.as_str(), "bbbb");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].commit.id.as_str(), "mmmm");
        assert_eq!(plan.steps[0].mainline, Some(2));
    }
}
