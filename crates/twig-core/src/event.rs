use crate::part::Delta;
use crate::record::{GenerationOutcome, GenerationStatus};
use crate::tree::BranchId;

// ---------------------------------------------------------------------------
// Conversation events — the render-oriented protocol from engine to UI
// ---------------------------------------------------------------------------

/// Events broadcast by a [`Conversation`](crate::Conversation).
///
/// A frontend subscribes to these to refresh its view. For one generation the
/// events form a protocol:
///
/// ```text
/// StatusChanged(Sending)
/// StatusChanged(Receiving) ContentAppended*   ← once content arrives
/// GenerationFinished
/// StatusChanged(Idle)
/// ```
///
/// Every other command that changes the tree emits `TreeChanged`.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// The tree shape or an active version changed.
    TreeChanged,

    /// `generation_status` moved to a new state.
    StatusChanged { status: GenerationStatus },

    /// Streamed content was appended to the target branch.
    ContentAppended { branch_id: BranchId, delta: Delta },

    /// A generation reached a terminal state and its outcome was applied.
    GenerationFinished {
        branch_id: BranchId,
        outcome: GenerationOutcome,
    },

    /// The snapshot could not be stored. The in-memory tree is unaffected.
    PersistenceFailed { error: String },
}
