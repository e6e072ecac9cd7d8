//! Support chat configuration.
//!
//! Loaded via the `config` crate from `SUPPORT_CHAT_*` environment variables;
//! every field has a default.

use serde::Deserialize;
use servicebell_core::ParticipantId;
use servicebell_store::{FileBackend, KeyValueBackend, MemoryBackend, PersistenceStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tunables of the support chat.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Maximum number of messages loaded per history page.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// Interval of the debounced persistence write, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Delay between a conversation closing and the session ending, in
    /// milliseconds.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// The support-routing participant added to every new channel.
    #[serde(default = "default_support_participant_id")]
    pub support_participant_id: String,

    /// First message of a new conversation.
    #[serde(default = "default_welcome_text")]
    pub welcome_text: String,

    /// Notice shown when support closes a conversation.
    #[serde(default = "default_closed_notice_text")]
    pub closed_notice_text: String,

    /// Notice shown when support resolves a conversation.
    #[serde(default = "default_resolved_notice_text")]
    pub resolved_notice_text: String,

    /// Directory of the file-backed store. In-memory storage when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Key namespace of persisted records.
    #[serde(default = "default_storage_namespace")]
    pub storage_namespace: String,
}

fn default_history_page_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_close_grace_ms() -> u64 {
    3_000
}

fn default_support_participant_id() -> String {
    "support_router".to_string()
}

fn default_welcome_text() -> String {
    "Hi! Thanks for reaching out. A member of our support team will be with you shortly."
        .to_string()
}

fn default_closed_notice_text() -> String {
    "This conversation has been closed by support.".to_string()
}

fn default_resolved_notice_text() -> String {
    "This conversation has been marked as resolved.".to_string()
}

fn default_storage_namespace() -> String {
    "support_chat".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_page_size: default_history_page_size(),
            flush_interval_ms: default_flush_interval_ms(),
            close_grace_ms: default_close_grace_ms(),
            support_participant_id: default_support_participant_id(),
            welcome_text: default_welcome_text(),
            closed_notice_text: default_closed_notice_text(),
            resolved_notice_text: default_resolved_notice_text(),
            storage_dir: None,
            storage_namespace: default_storage_namespace(),
        }
    }
}

impl ChatConfig {
    /// Loads configuration from `SUPPORT_CHAT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::with_prefix("SUPPORT_CHAT"))
    }

    fn from_environment(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                environment
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// The debounced flush interval.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// The closing grace delay.
    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// The support-routing participant.
    #[must_use]
    pub fn support_participant(&self) -> ParticipantId {
        ParticipantId::new(self.support_participant_id.clone())
    }

    /// Builds the persistence store this configuration describes.
    #[must_use]
    pub fn persistence_store(&self) -> PersistenceStore {
        let backend: Arc<dyn KeyValueBackend> = match &self.storage_dir {
            Some(dir) => Arc::new(FileBackend::new(dir.clone())),
            None => Arc::new(MemoryBackend::new()),
        };
        PersistenceStore::new(backend).with_namespace(self.storage_namespace.clone())
    }
}
