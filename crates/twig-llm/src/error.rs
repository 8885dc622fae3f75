/// Errors that can occur when interacting with a language model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was torn down through its cancellation signal.
    #[error("request aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the provider acknowledging a cancellation, as
    /// opposed to a genuine failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
