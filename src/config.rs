use crate::error::LotusError;
use std::path::PathBuf;
use std::time::Duration;

// --- Application settings ---

pub const DATABASE_PATH_VAR: &str = "LOTUSAI_DATABASE_PATH";
pub const KEYRING_SERVICE_VAR: &str = "LOTUSAI_KEYRING_SERVICE";
pub const REPLY_DELAY_VAR: &str = "LOTUSAI_REPLY_DELAY_MS";

const DEFAULT_KEYRING_SERVICE: &str = "LotusAI";
const DEFAULT_REPLY_DELAY_MS: u64 = 1000;

/// Runtime settings for the core. Every field can be overridden from the
/// environment; see [`AppConfig::from_env`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Keychain service name; the account is the provider name.
    pub keyring_service: String,
    /// How long the placeholder completion service "thinks" before replying.
    pub reply_delay: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
            reply_delay: Duration::from_millis(DEFAULT_REPLY_DELAY_MS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, LotusError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LotusError> {
        let mut config = Self::default();

        if let Some(path) = lookup(DATABASE_PATH_VAR).filter(|v| !v.trim().is_empty()) {
            log::debug!("Using database path from {}: {}", DATABASE_PATH_VAR, path);
            config.database_path = PathBuf::from(path);
        }
        if let Some(service) = lookup(KEYRING_SERVICE_VAR).filter(|v| !v.trim().is_empty()) {
            config.keyring_service = service;
        }
        if let Some(raw) = lookup(REPLY_DELAY_VAR) {
            let millis = raw.trim().parse::<u64>().map_err(|_| {
                LotusError::validation(format!(
                    "{} must be a whole number of milliseconds, got '{}'",
                    REPLY_DELAY_VAR, raw
                ))
            })?;
            config.reply_delay = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_keyring_service(mut self, service: impl Into<String>) -> Self {
        self.keyring_service = service.into();
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lotusai")
        .join("lotusai.sqlite")
}
