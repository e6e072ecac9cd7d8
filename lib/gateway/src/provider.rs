//! The messaging provider seen by the support chat.
//!
//! Shapes here mirror what a hosted chat provider exchanges: channels and
//! messages carry free-form strings (`custom_type`, metadata) and millisecond
//! timestamps. They are interpreted only in [`crate::convert`].

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use servicebell_core::{ChannelUrl, ParticipantId};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A channel as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChannel {
    /// Unique channel URL.
    pub url: ChannelUrl,
    /// Channel name.
    pub name: String,
    /// Free-form metadata (`status`, `priority`, `restaurant_id`).
    pub metadata: HashMap<String, String>,
    /// Channel members.
    pub member_ids: Vec<ParticipantId>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A message as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Provider-assigned id.
    pub message_id: String,
    /// Channel the message belongs to.
    pub channel_url: ChannelUrl,
    /// Sender.
    pub sender_id: ParticipantId,
    /// Message text.
    pub message: String,
    /// Provider-side message classification, if any.
    pub custom_type: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// Parameters for creating a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelParams {
    /// URL of the new channel.
    pub channel_url: ChannelUrl,
    /// Channel name.
    pub name: String,
    /// Initial members.
    pub member_ids: Vec<ParticipantId>,
    /// Initial metadata.
    pub metadata: HashMap<String, String>,
}

/// Parameters for sending a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageParams {
    /// Message text.
    pub message: String,
    /// Provider-side message classification.
    pub custom_type: Option<String>,
}

impl SendMessageParams {
    /// A plain text message.
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            custom_type: None,
        }
    }

    /// Sets the provider-side classification.
    #[must_use]
    pub fn with_custom_type(mut self, custom_type: impl Into<String>) -> Self {
        self.custom_type = Some(custom_type.into());
        self
    }
}

/// Events pushed by the provider over the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A message arrived in a channel.
    MessageReceived { message: RemoteMessage },
    /// A channel's metadata changed.
    ChannelChanged { channel: RemoteChannel },
    /// The set of members typing in a channel changed.
    TypingStatusUpdated {
        channel_url: ChannelUrl,
        typing_member_ids: Vec<ParticipantId>,
    },
    /// The realtime connection dropped; the provider is reconnecting.
    ConnectionLost,
    /// The realtime connection is back.
    ConnectionRestored,
}

/// An established provider connection.
#[derive(Debug)]
pub struct ProviderConnection {
    /// The participant the provider authenticated.
    pub participant_id: ParticipantId,
    /// The nickname the provider recorded.
    pub nickname: String,
    /// Realtime events, in the order the provider emits them.
    pub events: mpsc::UnboundedReceiver<ProviderEvent>,
}

/// Trait for a hosted realtime messaging provider.
///
/// All channel operations multiplex over the connection established by
/// [`MessagingProvider::connect`].
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Exchanges the identity and opens the realtime connection.
    async fn connect(
        &self,
        participant_id: &ParticipantId,
        nickname: &str,
    ) -> Result<ProviderConnection, ProviderError>;

    /// Looks up a channel by URL.
    async fn get_channel(&self, url: &ChannelUrl) -> Result<Option<RemoteChannel>, ProviderError>;

    /// Creates a channel.
    async fn create_channel(
        &self,
        params: CreateChannelParams,
    ) -> Result<RemoteChannel, ProviderError>;

    /// Sends a message as the connected participant.
    async fn send_message(
        &self,
        url: &ChannelUrl,
        params: SendMessageParams,
    ) -> Result<RemoteMessage, ProviderError>;

    /// Loads up to `limit` of the most recent messages, oldest first.
    async fn load_previous_messages(
        &self,
        url: &ChannelUrl,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, ProviderError>;

    /// Marks the channel as read by the connected participant.
    async fn mark_as_read(&self, url: &ChannelUrl) -> Result<(), ProviderError>;
}
