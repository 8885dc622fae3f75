use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use twig_llm::Usage;

use crate::error::{Error, Result};
use crate::part::{Delta, Part, apply_delta, plain_text};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub(crate) fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifies a branch. Stable across edits of that branch.
    BranchId
);
id_type!(
    /// Identifies one version of a branch.
    VersionId
);

// ---------------------------------------------------------------------------
// Version / Branch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One concrete content alternative of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    id: VersionId,
    parts: Vec<Part>,
    created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    continuation: Option<BranchId>,
}

impl Version {
    fn new(parts: Vec<Part>, continuation: Option<BranchId>) -> Self {
        Self {
            id: VersionId::generate(),
            parts,
            created_at_ms: now_ms(),
            usage: None,
            continuation,
        }
    }

    pub fn id(&self) -> &VersionId {
        &self.id
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// The branch that follows this version, if any.
    pub fn continuation(&self) -> Option<&BranchId> {
        self.continuation.as_ref()
    }
}

/// One turn slot of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    id: BranchId,
    role: Role,
    versions: Vec<Version>,
    current_version_index: usize,
}

impl Branch {
    fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: BranchId::generate(),
            role,
            versions: vec![Version::new(parts, None)],
            current_version_index: 0,
        }
    }

    pub fn id(&self) -> &BranchId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub fn current_version_index(&self) -> usize {
        self.current_version_index
    }

    pub fn current_version(&self) -> &Version {
        &self.versions[self.current_version_index]
    }

    fn current_version_mut(&mut self) -> &mut Version {
        &mut self.versions[self.current_version_index]
    }

    pub(crate) fn remove_current_version(&mut self) -> Version {
        let removed = self.versions.remove(self.current_version_index);
        self.current_version_index = self.current_version_index.saturating_sub(1);
        removed
    }

    pub(crate) fn references(&self, target: &BranchId) -> bool {
        self.versions
            .iter()
            .any(|v| v.continuation.as_ref() == Some(target))
    }

    pub(crate) fn clear_references(&mut self, target: &BranchId) {
        for version in &mut self.versions {
            if version.continuation.as_ref() == Some(target) {
                version.continuation = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream target
// ---------------------------------------------------------------------------

/// The single version currently open for streamed appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub branch_id: BranchId,
    pub version_id: VersionId,
}

// ---------------------------------------------------------------------------
// ConversationTree
// ---------------------------------------------------------------------------

/// Arena of branches plus the materialized current path.
///
/// `current_path` is never authored directly: every mutation that can change
/// an active version's continuation re-walks it from the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredTree", into = "StoredTree")]
pub struct ConversationTree {
    pub(crate) branches: HashMap<BranchId, Branch>,
    pub(crate) root: Option<BranchId>,
    pub(crate) current_path: Vec<BranchId>,
    pub(crate) stream_target: Option<StreamTarget>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&BranchId> {
        self.root.as_ref()
    }

    pub fn current_path(&self) -> &[BranchId] {
        &self.current_path
    }

    pub fn branch(&self, id: &BranchId) -> Option<&Branch> {
        self.branches.get(id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Branches on the current path, in conversation order.
    pub fn path_branches(&self) -> impl Iterator<Item = &Branch> {
        self.current_path
            .iter()
            .filter_map(|id| self.branches.get(id))
    }

    /// Plain text of the current path, one paragraph per branch. Feeds
    /// external search indexing.
    pub fn path_text(&self) -> String {
        self.path_branches()
            .map(|branch| plain_text(branch.current_version().parts()))
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn stream_target(&self) -> Option<&StreamTarget> {
        self.stream_target.as_ref()
    }

    pub fn position_in_path(&self, id: &BranchId) -> Option<usize> {
        self.current_path.iter().position(|b| b == id)
    }

    // -- commands --

    /// Append a new branch with a single version at the end of the current
    /// path. The first branch of an empty tree becomes the root.
    pub fn add_branch(&mut self, role: Role, parts: Vec<Part>) -> BranchId {
        let branch = Branch::new(role, parts);
        let id = branch.id.clone();

        let tail = self.current_path.last().cloned();
        match tail.and_then(|tail| self.branches.get_mut(&tail)) {
            Some(tail) => tail.current_version_mut().continuation = Some(id.clone()),
            None => self.root = Some(id.clone()),
        }

        self.branches.insert(id.clone(), branch);
        self.current_path.push(id.clone());
        id
    }

    /// Append a version to `branch_id` and make it active.
    ///
    /// With `inherit_continuation` the new version points at the same
    /// downstream branch as the previously active one; otherwise it starts
    /// without a continuation and the path ends at this branch.
    pub fn add_version(
        &mut self,
        branch_id: &BranchId,
        parts: Vec<Part>,
        inherit_continuation: bool,
    ) -> Result<VersionId> {
        // An inheriting version upstream of the target leaves the path as is.
        let keeps_path = inherit_continuation
            && self
                .stream_target
                .as_ref()
                .is_some_and(|target| &target.branch_id != branch_id);
        if !keeps_path {
            self.ensure_path_unlocked(branch_id)?;
        }
        let branch = self.branch_mut(branch_id)?;

        let continuation = if inherit_continuation {
            branch.current_version().continuation.clone()
        } else {
            None
        };
        let version = Version::new(parts, continuation);
        let version_id = version.id.clone();

        branch.versions.push(version);
        branch.current_version_index = branch.versions.len() - 1;

        self.rederive_path();
        Ok(version_id)
    }

    /// Move the active version of `branch_id` by one step. There is no
    /// wraparound: stepping past either end is rejected and nothing changes.
    pub fn switch_version(&mut self, branch_id: &BranchId, direction: i32) -> Result<()> {
        if direction != 1 && direction != -1 {
            return Err(Error::invalid_state(format!(
                "version switch direction must be +1 or -1, got {direction}"
            )));
        }
        self.ensure_path_unlocked(branch_id)?;
        let branch = self.branch_mut(branch_id)?;

        let next = branch.current_version_index as i64 + i64::from(direction);
        if next < 0 || next >= branch.versions.len() as i64 {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' has no version at index {next}"
            )));
        }
        branch.current_version_index = next as usize;

        self.rederive_path();
        Ok(())
    }

    /// Append streamed content to the active version of `branch_id`.
    pub fn append_content(&mut self, branch_id: &BranchId, delta: Delta) -> Result<()> {
        let target = self
            .stream_target
            .as_ref()
            .filter(|target| &target.branch_id == branch_id)
            .ok_or_else(|| Error::NotStreaming(branch_id.clone()))?;

        let version = self
            .branches
            .get_mut(branch_id)
            .map(Branch::current_version_mut)
            .filter(|version| version.id == target.version_id)
            .ok_or_else(|| Error::NotStreaming(branch_id.clone()))?;

        apply_delta(&mut version.parts, delta);
        Ok(())
    }

    // -- stream target --

    /// Open the active version of `branch_id` for streamed appends.
    pub(crate) fn open_stream(&mut self, branch_id: &BranchId) -> Result<StreamTarget> {
        if self.position_in_path(branch_id).is_none() {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is not on the current path"
            )));
        }
        let branch = self.branch_mut(branch_id)?;
        let target = StreamTarget {
            branch_id: branch_id.clone(),
            version_id: branch.current_version().id.clone(),
        };
        self.stream_target = Some(target.clone());
        Ok(target)
    }

    pub(crate) fn close_stream(&mut self) -> Option<StreamTarget> {
        self.stream_target.take()
    }

    pub(crate) fn version_mut(&mut self, target: &StreamTarget) -> Option<&mut Version> {
        self.branches
            .get_mut(&target.branch_id)?
            .versions
            .iter_mut()
            .find(|v| v.id == target.version_id)
    }

    pub(crate) fn overwrite_parts(&mut self, target: &StreamTarget, parts: Vec<Part>) {
        if let Some(version) = self.version_mut(target) {
            version.parts = parts;
        }
    }

    pub(crate) fn record_usage(&mut self, target: &StreamTarget, usage: Usage) {
        if let Some(version) = self.version_mut(target) {
            version.usage = Some(usage);
        }
    }

    /// Reject mutations that would move the stream target off the current
    /// path: anything on the path at or before the target is locked while a
    /// stream is open.
    pub(crate) fn ensure_path_unlocked(&self, branch_id: &BranchId) -> Result<()> {
        let Some(target) = &self.stream_target else {
            return Ok(());
        };
        let (Some(branch_pos), Some(target_pos)) = (
            self.position_in_path(branch_id),
            self.position_in_path(&target.branch_id),
        ) else {
            return Ok(());
        };
        if branch_pos <= target_pos {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is locked by the in-flight generation"
            )));
        }
        Ok(())
    }

    // -- history --

    /// Every branch on the current path strictly before `branch_id`.
    pub fn history_before(&self, branch_id: &BranchId) -> Result<Vec<&Branch>> {
        let pos = self.position_in_path(branch_id).ok_or_else(|| {
            Error::invalid_state(format!("branch '{branch_id}' is not on the current path"))
        })?;
        Ok(self.current_path[..pos]
            .iter()
            .filter_map(|id| self.branches.get(id))
            .collect())
    }

    // -- structure --

    pub(crate) fn branch_mut(&mut self, id: &BranchId) -> Result<&mut Branch> {
        self.branches
            .get_mut(id)
            .ok_or_else(|| Error::BranchNotFound(id.clone()))
    }

    /// Re-walk the path from the root through each active continuation.
    pub(crate) fn rederive_path(&mut self) {
        self.current_path = self.walk_path();
    }

    fn walk_path(&self) -> Vec<BranchId> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.root.clone();

        while let Some(id) = cursor {
            let Some(branch) = self.branches.get(&id) else {
                break;
            };
            let Some(version) = branch.versions.get(branch.current_version_index) else {
                break;
            };
            if !seen.insert(id.clone()) {
                break;
            }
            cursor = version.continuation.clone();
            path.push(id);
        }
        path
    }

    /// All branches reachable from `start` through any version's
    /// continuation, `start` included.
    pub(crate) fn reachable_from(&self, start: &BranchId) -> HashSet<BranchId> {
        let mut seen = HashSet::new();
        let mut stack = vec![start.clone()];
        while let Some(id) = stack.pop() {
            let Some(branch) = self.branches.get(&id) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            stack.extend(
                branch
                    .versions
                    .iter()
                    .filter_map(|v| v.continuation.clone()),
            );
        }
        seen
    }

    /// Drop every branch no longer reachable from the root. Returns how many
    /// were removed.
    pub(crate) fn prune_unreachable(&mut self) -> usize {
        let reachable = match &self.root {
            Some(root) => self.reachable_from(root),
            None => HashSet::new(),
        };
        let before = self.branches.len();
        self.branches.retain(|id, _| reachable.contains(id));
        before - self.branches.len()
    }

    /// Check every structural invariant of the tree.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |message: String| Err(Error::CorruptTree(message));

        match &self.root {
            None if !self.branches.is_empty() => {
                return corrupt("branches present without a root".into());
            }
            Some(root) if !self.branches.contains_key(root) => {
                return corrupt(format!("root '{root}' does not exist"));
            }
            _ => {}
        }

        let mut parents: HashMap<&BranchId, &BranchId> = HashMap::new();
        for (id, branch) in &self.branches {
            if &branch.id != id {
                return corrupt(format!("branch '{}' stored under key '{id}'", branch.id));
            }
            if branch.versions.is_empty() {
                return corrupt(format!("branch '{id}' has no versions"));
            }
            if branch.current_version_index >= branch.versions.len() {
                return corrupt(format!(
                    "branch '{id}' selects version {} of {}",
                    branch.current_version_index,
                    branch.versions.len()
                ));
            }
            for next in branch.versions.iter().filter_map(|v| v.continuation.as_ref()) {
                if !self.branches.contains_key(next) {
                    return corrupt(format!("branch '{id}' continues into missing '{next}'"));
                }
                if Some(next) == self.root.as_ref() {
                    return corrupt(format!("branch '{id}' continues into the root"));
                }
                // Sibling versions may share a continuation; different
                // branches may not.
                if let Some(previous) = parents.insert(next, id)
                    && previous != id
                {
                    return corrupt(format!(
                        "branch '{next}' is continued from both '{previous}' and '{id}'"
                    ));
                }
            }
        }

        if let Some(root) = &self.root
            && self.reachable_from(root).len() != self.branches.len()
        {
            return corrupt("tree holds unreachable branches".into());
        }

        if self.current_path != self.walk_path() {
            return corrupt("current path diverges from the active versions".into());
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

/// On-the-wire shape of a tree. The path is derived, and the stream target
/// only exists in memory, so neither is stored.
#[derive(Serialize, Deserialize)]
struct StoredTree {
    root: Option<BranchId>,
    branches: Vec<Branch>,
}

impl From<ConversationTree> for StoredTree {
    fn from(tree: ConversationTree) -> Self {
        let mut branches: Vec<Branch> = tree.branches.into_values().collect();
        branches.sort_by_key(|b| {
            (
                b.versions.first().map(|v| v.created_at_ms),
                b.id.clone(),
            )
        });
        StoredTree {
            root: tree.root,
            branches,
        }
    }
}

impl TryFrom<StoredTree> for ConversationTree {
    type Error = Error;

    fn try_from(stored: StoredTree) -> Result<Self> {
        let mut tree = ConversationTree {
            branches: stored
                .branches
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect(),
            root: stored.root,
            current_path: Vec::new(),
            stream_target: None,
        };
        tree.rederive_path();
        tree.validate()?;
        Ok(tree)
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
