//! Typed persistence of support conversations.
//!
//! Durability is best-effort: every failure is logged and reported to the
//! caller as a cache miss (on load) or an unsaved write (on save). Callers
//! merge before saving; `save` is last-write-wins.

use crate::backend::KeyValueBackend;
use crate::error::PersistenceError;
use servicebell_core::{ChannelUrl, PersistedChatRecord, RestaurantId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default key namespace.
const DEFAULT_NAMESPACE: &str = "support_chat";

/// Persistence of [`PersistedChatRecord`]s keyed by restaurant.
#[derive(Clone)]
pub struct PersistenceStore {
    backend: Arc<dyn KeyValueBackend>,
    namespace: String,
}

impl PersistenceStore {
    /// Creates a store over a backend using the default namespace.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Uses a different key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn key(&self, restaurant_id: &RestaurantId) -> String {
        format!("{}:{restaurant_id}", self.namespace)
    }

    /// Archive keys carry their own prefix so they never equal the current
    /// record key of a restaurant whose id contains `:`.
    fn archive_key(&self, restaurant_id: &RestaurantId, channel_url: &ChannelUrl) -> String {
        format!("{}.archive:{restaurant_id}:{channel_url}", self.namespace)
    }

    /// Loads the current record of a restaurant.
    ///
    /// Read and decode failures are logged and treated as a cache miss.
    #[must_use]
    pub fn load(&self, restaurant_id: &RestaurantId) -> Option<PersistedChatRecord> {
        let key = self.key(restaurant_id);
        match self.try_read(&key) {
            Ok(record) => record,
            Err(e) => {
                warn!(restaurant_id = %restaurant_id, error = %e, "treating unreadable chat record as cache miss");
                None
            }
        }
    }

    /// Overwrites the current record of a restaurant.
    ///
    /// Returns false if the write failed; the failure is logged.
    pub fn save(&self, restaurant_id: &RestaurantId, record: &PersistedChatRecord) -> bool {
        let key = self.key(restaurant_id);
        match self.try_write(&key, record) {
            Ok(()) => {
                debug!(
                    restaurant_id = %restaurant_id,
                    channel_url = %record.channel_meta.channel_url,
                    messages = record.messages.len(),
                    "chat record saved"
                );
                true
            }
            Err(e) => {
                warn!(restaurant_id = %restaurant_id, error = %e, "failed to save chat record");
                false
            }
        }
    }

    /// Keeps a superseded conversation queryable under its channel URL.
    pub fn archive(&self, record: &PersistedChatRecord) -> bool {
        let meta = &record.channel_meta;
        let key = self.archive_key(&meta.restaurant_id, &meta.channel_url);
        match self.try_write(&key, record) {
            Ok(()) => {
                debug!(channel_url = %meta.channel_url, "chat record archived");
                true
            }
            Err(e) => {
                warn!(channel_url = %meta.channel_url, error = %e, "failed to archive chat record");
                false
            }
        }
    }

    /// Loads an archived conversation.
    #[must_use]
    pub fn load_archived(
        &self,
        restaurant_id: &RestaurantId,
        channel_url: &ChannelUrl,
    ) -> Option<PersistedChatRecord> {
        let key = self.archive_key(restaurant_id, channel_url);
        match self.try_read(&key) {
            Ok(record) => record,
            Err(e) => {
                warn!(channel_url = %channel_url, error = %e, "treating unreadable archive as cache miss");
                None
            }
        }
    }

    fn try_read(&self, key: &str) -> Result<Option<PersistedChatRecord>, PersistenceError> {
        let Some(raw) = self.backend.get_item(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| PersistenceError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn try_write(&self, key: &str, record: &PersistedChatRecord) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string(record).map_err(|e| PersistenceError::EncodeFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.backend.set_item(key, &raw)
    }
}

impl std::fmt::Debug for PersistenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
