use crate::error::{Error, Result};
use crate::part::Part;
use crate::record::ConversationRecord;
use crate::tree::{Branch, BranchId, Role, VersionId};

/// What an edit did to the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// The new content matched the active version; nothing changed.
    Unchanged,
    /// A new version was added and no reply is needed.
    Edited { version_id: VersionId },
    /// A new version was added and `reply_branch` must be generated.
    NeedsReply {
        version_id: VersionId,
        reply_branch: BranchId,
    },
}

impl ConversationRecord {
    /// Replace the content of a user message.
    ///
    /// The edit forks the conversation: the new version starts without a
    /// continuation and a fresh model branch is appended after it, since the
    /// old reply answered different input. Switching back to the previous
    /// version restores the old reply.
    pub fn edit_user_message(&mut self, branch_id: &BranchId, parts: Vec<Part>) -> Result<Edit> {
        self.ensure_idle("edit a message")?;
        let branch = self.branch_with_role(branch_id, Role::User)?;
        if same_content(branch, &parts) {
            return Ok(Edit::Unchanged);
        }

        let version_id = self.add_version(branch_id, parts, false)?;
        let reply_branch = self.add_branch(Role::Model, vec![Part::placeholder()])?;
        Ok(Edit::NeedsReply {
            version_id,
            reply_branch,
        })
    }

    /// Replace the content of a model reply. The rest of the conversation is
    /// kept: the new version inherits the downstream turns.
    pub fn edit_ai_message(&mut self, branch_id: &BranchId, parts: Vec<Part>) -> Result<Edit> {
        let branch = self.branch_with_role(branch_id, Role::Model)?;
        if same_content(branch, &parts) {
            return Ok(Edit::Unchanged);
        }

        let version_id = self.add_version(branch_id, parts, true)?;
        Ok(Edit::Edited { version_id })
    }

    /// Add an empty version to a model branch so a new reply can be streamed
    /// into it. Prompt history is everything on the path before the branch.
    pub fn regenerate(&mut self, branch_id: &BranchId) -> Result<Edit> {
        self.branch_with_role(branch_id, Role::Model)?;
        self.ensure_idle("regenerate a reply")?;
        if self.tree().position_in_path(branch_id).is_none() {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is not on the current path"
            )));
        }

        let version_id = self.add_version(branch_id, vec![Part::placeholder()], false)?;
        Ok(Edit::NeedsReply {
            version_id,
            reply_branch: branch_id.clone(),
        })
    }

    fn branch_with_role(&self, branch_id: &BranchId, role: Role) -> Result<&Branch> {
        let branch = self
            .tree()
            .branch(branch_id)
            .ok_or_else(|| Error::BranchNotFound(branch_id.clone()))?;
        if branch.role() != role {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is a {:?} branch, expected {role:?}",
                branch.role()
            )));
        }
        Ok(branch)
    }
}

/// Whether `parts` is part-by-part identical to the branch's active version.
fn same_content(branch: &Branch, parts: &[Part]) -> bool {
    branch.current_version().parts() == parts
}
