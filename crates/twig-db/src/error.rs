#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl From<Error> for twig_core::PersistenceError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidSnapshot(message) => twig_core::PersistenceError::InvalidSnapshot(message),
            other => twig_core::PersistenceError::storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
