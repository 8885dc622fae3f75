use tracing::debug;

use crate::error::{Error, Result};
use crate::tree::{BranchId, ConversationTree};

/// What a delete command actually removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion {
    /// Only the active version went away; the branch survives with a sibling
    /// selected.
    Version { branches_removed: usize },
    /// The branch itself was removed together with its downstream subtree.
    Branch { branches_removed: usize },
}

impl Deletion {
    pub fn branches_removed(&self) -> usize {
        match self {
            Deletion::Version { branches_removed } | Deletion::Branch { branches_removed } => {
                *branches_removed
            }
        }
    }
}

impl ConversationTree {
    /// Remove the active version of `branch_id`.
    ///
    /// The previous sibling (or the next one, if the first version was removed)
    /// becomes active. A branch never survives with zero versions: removing
    /// its only version removes the branch. Downstream branches that were
    /// reachable only through the removed version are dropped as well.
    pub fn delete_version(&mut self, branch_id: &BranchId) -> Result<Deletion> {
        self.ensure_not_streaming_into(branch_id)?;

        let branch = self.branch_mut(branch_id)?;
        if branch.version_count() == 1 {
            let branches_removed = self.delete_branch(branch_id)?;
            return Ok(Deletion::Branch { branches_removed });
        }

        let removed = branch.remove_current_version();
        let orphaned = removed
            .continuation()
            .filter(|next| !branch.references(next))
            .is_some();

        self.rederive_path();
        let branches_removed = if orphaned { self.prune_unreachable() } else { 0 };

        debug!(
            branch_id = %branch_id,
            version_id = %removed.id(),
            branches_removed,
            "deleted version"
        );
        Ok(Deletion::Version { branches_removed })
    }

    /// Remove `branch_id` and every branch reachable from any of its
    /// versions, across all forks. The current path is truncated where the
    /// branch used to be. Returns the number of branches removed.
    pub fn delete_branch(&mut self, branch_id: &BranchId) -> Result<usize> {
        self.ensure_not_streaming_into(branch_id)?;
        if !self.branches.contains_key(branch_id) {
            return Err(Error::BranchNotFound(branch_id.clone()));
        }

        if self.root.as_ref() == Some(branch_id) {
            self.root = None;
        }
        for branch in self.branches.values_mut() {
            branch.clear_references(branch_id);
        }

        let branches_removed = self.prune_unreachable();
        self.rederive_path();

        debug!(branch_id = %branch_id, branches_removed, "deleted branch");
        Ok(branches_removed)
    }

    /// Deletions are refused while the stream target lives in the subtree
    /// rooted at `branch_id`.
    fn ensure_not_streaming_into(&self, branch_id: &BranchId) -> Result<()> {
        let Some(target) = &self.stream_target else {
            return Ok(());
        };
        if self.reachable_from(branch_id).contains(&target.branch_id) {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' holds the in-flight generation"
            )));
        }
        Ok(())
    }
}
