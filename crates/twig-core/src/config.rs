use std::time::Duration;

/// How long a generation may wait for its first content chunk.
pub const DEFAULT_FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_STOPPED_MARKER: &str = "_Generation stopped._";
const DEFAULT_EMPTY_REPLY_MARKER: &str = "_The model returned an empty reply._";
const DEFAULT_ERROR_PREFIX: &str = "Something went wrong while generating a reply";

/// Tunables of the streaming generation engine.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Watchdog duration armed when a generation enters `sending`.
    pub first_chunk_timeout: Duration,
    /// Written into a cancelled reply that produced no content.
    pub stopped_marker: String,
    /// Written into a reply whose stream ended without any content.
    pub empty_reply_marker: String,
    /// Written into a reply whose first chunk never arrived. `None` derives a
    /// message from `first_chunk_timeout`.
    pub timeout_message: Option<String>,
    /// Leads the message written into a reply that failed.
    pub error_prefix: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            first_chunk_timeout: DEFAULT_FIRST_CHUNK_TIMEOUT,
            stopped_marker: DEFAULT_STOPPED_MARKER.to_string(),
            empty_reply_marker: DEFAULT_EMPTY_REPLY_MARKER.to_string(),
            timeout_message: None,
            error_prefix: DEFAULT_ERROR_PREFIX.to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn with_first_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.first_chunk_timeout = timeout;
        self
    }

    pub fn timeout_message(&self) -> String {
        match &self.timeout_message {
            Some(message) => message.clone(),
            None => format!(
                "The model did not respond within {} seconds. Please try again.",
                self.first_chunk_timeout.as_secs()
            ),
        }
    }

    pub fn error_message(&self, detail: &str) -> String {
        format!("{}: {detail}", self.error_prefix)
    }
}
