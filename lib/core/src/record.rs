//! The locally persisted state of a restaurant's support conversation.

use crate::channel::ChannelMetadata;
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the client remembers about a conversation between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChatRecord {
    /// Last known channel metadata.
    pub channel_meta: ChannelMetadata,
    /// Messages ordered by `(created_at, id)` without duplicate ids.
    pub messages: Vec<Message>,
    /// When the record last reflected the provider's state.
    pub last_synced_at: DateTime<Utc>,
}

impl PersistedChatRecord {
    /// Creates a record with no messages.
    #[must_use]
    pub fn new(channel_meta: ChannelMetadata) -> Self {
        Self {
            channel_meta,
            messages: Vec::new(),
            last_synced_at: Utc::now(),
        }
    }

    /// Returns true if the conversation has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.channel_meta.status.is_terminal()
    }
}
