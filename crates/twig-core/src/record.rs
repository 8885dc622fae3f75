use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use twig_llm::Usage;

use crate::config::GenerationConfig;
use crate::deletion::Deletion;
use crate::error::{Error, Result};
use crate::part::{Delta, Part, has_content};
use crate::persistence::ConversationSnapshot;
use crate::tree::{BranchId, ConversationTree, Role, StreamTarget, VersionId, now_ms};

const TITLE_MAX_CHARS: usize = 80;

/// Generation state of a conversation. There is exactly one per record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Sending,
    Receiving,
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The provider finished the stream normally.
    Completed,
    /// Stopped by the caller, or superseded by a newer generation.
    Cancelled,
    /// No content arrived before the first-chunk watchdog fired.
    TimedOut,
    /// The provider reported a failure.
    Failed { message: String },
}

impl GenerationOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, GenerationOutcome::TimedOut | GenerationOutcome::Failed { .. })
    }
}

/// Result of feeding one chunk to the active generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkApplied {
    /// First content of the generation; status moved to `receiving`.
    First,
    More,
    /// The generation is no longer the active one.
    Stale,
}

/// The in-flight generation of a record. Replaced atomically: arming a new
/// one settles the previous one first.
#[derive(Debug)]
struct ActiveGeneration {
    seq: u64,
    token: CancellationToken,
    target: StreamTarget,
}

/// One conversation: metadata, its tree and its generation state.
#[derive(Debug)]
pub struct ConversationRecord {
    id: String,
    title: Option<String>,
    model: String,
    project_id: Option<String>,
    tree: ConversationTree,
    status: GenerationStatus,
    has_error: bool,
    created_at_ms: i64,
    updated_at_ms: i64,
    active: Option<ActiveGeneration>,
    next_seq: u64,
}

impl ConversationRecord {
    pub fn new(model: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: format!("conv_{}", uuid::Uuid::new_v4().simple()),
            title: None,
            model: model.into(),
            project_id: None,
            tree: ConversationTree::new(),
            status: GenerationStatus::Idle,
            has_error: false,
            created_at_ms: now,
            updated_at_ms: now,
            active: None,
            next_seq: 1,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn from_snapshot(snapshot: ConversationSnapshot) -> Self {
        let mut tree = snapshot.tree;
        tree.close_stream();
        Self {
            id: snapshot.id,
            title: snapshot.title,
            model: snapshot.model,
            project_id: snapshot.project_id,
            tree,
            status: GenerationStatus::Idle,
            has_error: snapshot.has_error,
            created_at_ms: snapshot.created_at_ms,
            updated_at_ms: snapshot.updated_at_ms,
            active: None,
            next_seq: 1,
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let mut tree = self.tree.clone();
        tree.close_stream();
        ConversationSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            model: self.model.clone(),
            project_id: self.project_id.clone(),
            tree,
            has_error: self.has_error,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }

    // -- queries --

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn tree(&self) -> &ConversationTree {
        &self.tree
    }

    pub fn current_path(&self) -> &[BranchId] {
        self.tree.current_path()
    }

    pub fn generation_status(&self) -> GenerationStatus {
        self.status
    }

    pub fn is_generating(&self) -> bool {
        self.status != GenerationStatus::Idle
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn updated_at_ms(&self) -> i64 {
        self.updated_at_ms
    }

    pub fn path_text(&self) -> String {
        self.tree.path_text()
    }

    // -- commands --

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
        self.touch();
    }

    pub fn acknowledge_error(&mut self) {
        self.has_error = false;
    }

    /// Append a branch at the end of the current path. A user branch starts a
    /// new turn and is refused while a generation is running.
    pub fn add_branch(&mut self, role: Role, parts: Vec<Part>) -> Result<BranchId> {
        if role == Role::User {
            self.ensure_idle("start a new turn")?;
        }
        let branch_id = self.tree.add_branch(role, parts);
        if role == Role::User && self.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
            let parts = self
                .tree
                .branch(&branch_id)
                .map(|b| b.current_version().parts().to_vec())
                .unwrap_or_default();
            self.title = derive_title(&parts);
        }
        self.touch();
        Ok(branch_id)
    }

    pub fn add_version(
        &mut self,
        branch_id: &BranchId,
        parts: Vec<Part>,
        inherit_continuation: bool,
    ) -> Result<VersionId> {
        let version_id = self
            .tree
            .add_version(branch_id, parts, inherit_continuation)?;
        self.touch();
        Ok(version_id)
    }

    pub fn switch_version(&mut self, branch_id: &BranchId, direction: i32) -> Result<()> {
        self.tree.switch_version(branch_id, direction)?;
        self.touch();
        Ok(())
    }

    pub fn delete_version(&mut self, branch_id: &BranchId) -> Result<Deletion> {
        let deletion = self.tree.delete_version(branch_id)?;
        self.touch();
        Ok(deletion)
    }

    pub fn delete_branch(&mut self, branch_id: &BranchId) -> Result<usize> {
        let removed = self.tree.delete_branch(branch_id)?;
        self.touch();
        Ok(removed)
    }

    pub(crate) fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.is_generating() {
            return Err(Error::invalid_state(format!(
                "cannot {action} while a reply is being generated"
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }

    // -- generation lifecycle --

    /// Arm a generation targeting the active version of `branch_id`.
    ///
    /// Any generation still armed on this record is cancelled and settled
    /// first, so two writers never target the record at once.
    pub(crate) fn begin_generation(
        &mut self,
        branch_id: &BranchId,
        config: &GenerationConfig,
    ) -> Result<(u64, CancellationToken)> {
        let branch = self
            .tree
            .branch(branch_id)
            .ok_or_else(|| Error::BranchNotFound(branch_id.clone()))?;
        if branch.role() != Role::Model {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is not a model branch"
            )));
        }
        if self.tree.position_in_path(branch_id).is_none() {
            return Err(Error::invalid_state(format!(
                "branch '{branch_id}' is not on the current path"
            )));
        }

        if let Some(previous) = self.active.take() {
            debug!(
                conversation_id = %self.id,
                generation = previous.seq,
                "superseding in-flight generation"
            );
            previous.token.cancel();
            self.settle(previous, &GenerationOutcome::Cancelled, None, config);
        }

        let target = self.tree.open_stream(branch_id)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let token = CancellationToken::new();

        self.active = Some(ActiveGeneration {
            seq,
            token: token.clone(),
            target,
        });
        self.status = GenerationStatus::Sending;
        Ok((seq, token))
    }

    pub(crate) fn active_generation(&self) -> Option<(u64, &BranchId)> {
        self.active
            .as_ref()
            .map(|active| (active.seq, &active.target.branch_id))
    }

    pub(crate) fn is_awaiting_first_chunk(&self, seq: u64) -> bool {
        self.status == GenerationStatus::Sending
            && self.active.as_ref().is_some_and(|a| a.seq == seq)
    }

    pub(crate) fn apply_chunk(&mut self, seq: u64, delta: Delta) -> Result<ChunkApplied> {
        let Some(active) = self.active.as_ref().filter(|a| a.seq == seq) else {
            return Ok(ChunkApplied::Stale);
        };
        self.tree.append_content(&active.target.branch_id, delta)?;

        if self.status == GenerationStatus::Sending {
            self.status = GenerationStatus::Receiving;
            return Ok(ChunkApplied::First);
        }
        Ok(ChunkApplied::More)
    }

    /// Apply the terminal mutation for generation `seq`. Returns the target
    /// branch, or `None` when the generation was already settled elsewhere
    /// (cancelled or superseded).
    pub(crate) fn finish_generation(
        &mut self,
        seq: u64,
        outcome: &GenerationOutcome,
        usage: Option<Usage>,
        config: &GenerationConfig,
    ) -> Option<BranchId> {
        let active = self.active.take_if(|a| a.seq == seq)?;
        let branch_id = active.target.branch_id.clone();
        self.settle(active, outcome, usage, config);
        Some(branch_id)
    }

    /// Cancel the in-flight generation, if any, and settle it immediately.
    pub fn cancel_generation(&mut self, config: &GenerationConfig) -> Option<BranchId> {
        let active = self.active.take()?;
        active.token.cancel();
        let branch_id = active.target.branch_id.clone();
        self.settle(active, &GenerationOutcome::Cancelled, None, config);
        Some(branch_id)
    }

    fn settle(
        &mut self,
        active: ActiveGeneration,
        outcome: &GenerationOutcome,
        usage: Option<Usage>,
        config: &GenerationConfig,
    ) {
        let target = active.target;
        let produced = self
            .tree
            .version_mut(&target)
            .is_some_and(|v| has_content(v.parts()));
        match outcome {
            GenerationOutcome::Completed => {
                if !produced {
                    self.tree
                        .overwrite_parts(&target, vec![Part::text(&config.empty_reply_marker)]);
                }
                if let Some(usage) = usage {
                    self.tree.record_usage(&target, usage);
                }
                self.has_error = false;
            }
            GenerationOutcome::Cancelled => {
                if !produced {
                    self.tree
                        .overwrite_parts(&target, vec![Part::text(&config.stopped_marker)]);
                }
                self.has_error = false;
            }
            GenerationOutcome::TimedOut => {
                self.tree
                    .overwrite_parts(&target, vec![Part::text(config.timeout_message())]);
                self.has_error = true;
            }
            GenerationOutcome::Failed { message } => {
                self.tree
                    .overwrite_parts(&target, vec![Part::text(config.error_message(message))]);
                self.has_error = true;
            }
        }

        self.tree.close_stream();
        self.status = GenerationStatus::Idle;
        self.touch();
        debug!(
            conversation_id = %self.id,
            generation = active.seq,
            branch_id = %target.branch_id,
            ?outcome,
            "generation settled"
        );
    }
}

fn derive_title(parts: &[Part]) -> Option<String> {
    let title_text = parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text.trim()),
            Part::Image { .. } => None,
        })
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let normalized = title_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }

    Some(truncate_with_ellipsis(&normalized, TITLE_MAX_CHARS))
}

fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let mut truncated = input.chars().take(max_chars).collect::<String>();
    truncated.push('…');
    truncated
}
