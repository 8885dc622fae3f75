use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use twig_core::{
    ConversationManager, DEFAULT_FIRST_CHUNK_TIMEOUT, GenerationConfig, PersistenceGateway,
};
use twig_llm::LanguageModelProvider;

const APP_QUALIFIER: &str = "dev";
const APP_ORGANIZATION: &str = "twig";
const APP_NAME: &str = "twig";
const CONVERSATION_DB_FILENAME: &str = "conversations.sqlite3";

pub const DEFAULT_MODEL_ID: &str = "gpt-5";

const ENV_DB_PATH: &str = "TWIG_DB_PATH";
const ENV_DEFAULT_MODEL: &str = "TWIG_DEFAULT_MODEL";
const ENV_FIRST_CHUNK_TIMEOUT: &str = "TWIG_FIRST_CHUNK_TIMEOUT_SECS";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not resolve user data directory")]
    MissingUserDataDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// App-local user data directory (for durable application state).
pub fn user_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .ok_or(Error::MissingUserDataDir)?;
    Ok(dirs.data_local_dir().to_path_buf())
}

pub fn ensure_user_data_dir() -> Result<PathBuf> {
    let dir = user_data_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn conversation_db_path() -> Result<PathBuf> {
    Ok(ensure_user_data_dir()?.join(CONVERSATION_DB_FILENAME))
}

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `TWIG_DB_PATH`, when set. See [`Config::db_path`].
    pub db_path_override: Option<PathBuf>,
    pub default_model: String,
    pub first_chunk_timeout: Duration,
}

impl Config {
    /// Load `.env` (if present) and read `TWIG_*` variables, falling back to
    /// the platform data directory and built-in defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let db_path_override = var(ENV_DB_PATH).map(PathBuf::from);
        let default_model = var(ENV_DEFAULT_MODEL).unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let first_chunk_timeout = match var(ENV_FIRST_CHUNK_TIMEOUT) {
            Some(value) => parse_secs(ENV_FIRST_CHUNK_TIMEOUT, &value)?,
            None => DEFAULT_FIRST_CHUNK_TIMEOUT,
        };

        Ok(Self {
            db_path_override,
            default_model,
            first_chunk_timeout,
        })
    }

    /// The conversation database. The platform data directory is only
    /// resolved (and created) when no override is set.
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path_override {
            Some(path) => Ok(path.clone()),
            None => conversation_db_path(),
        }
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig::default().with_first_chunk_timeout(self.first_chunk_timeout)
    }

    /// A manager that creates conversations with the configured default model
    /// and streams with the configured first-chunk timeout.
    pub fn conversation_manager(
        &self,
        provider: Arc<LanguageModelProvider>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> ConversationManager {
        ConversationManager::new(provider, gateway, &self.default_model)
            .with_config(self.generation_config())
    }
}

fn parse_secs(name: &'static str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(Error::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}
