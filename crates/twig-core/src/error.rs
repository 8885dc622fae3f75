use crate::tree::BranchId;

/// Structural errors returned by conversation commands.
///
/// A command that fails with one of these has not touched the tree.
/// Streaming failures are never reported here; they end up as content on the
/// target version (see [`GenerationOutcome`](crate::GenerationOutcome)).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("branch '{0}' is not receiving a stream")]
    NotStreaming(BranchId),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("corrupt conversation tree: {0}")]
    CorruptTree(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
}

impl Error {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
