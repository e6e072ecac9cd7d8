//! In-process messaging provider.
//!
//! Keeps channels and messages in memory and exposes the support side of the
//! conversation (posting, closing, typing, connection drops) as plain method
//! calls. Used by tests and for running the chat without a hosted provider.

use crate::convert::META_STATUS;
use crate::error::ProviderError;
use crate::provider::{
    CreateChannelParams, MessagingProvider, ProviderConnection, ProviderEvent, RemoteChannel,
    RemoteMessage, SendMessageParams,
};
use async_trait::async_trait;
use chrono::Utc;
use servicebell_core::{ChannelUrl, ParticipantId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Participant the support side posts as.
const SUPPORT_SENDER: &str = "support_router";

struct StoredChannel {
    channel: RemoteChannel,
    messages: Vec<RemoteMessage>,
}

#[derive(Default)]
struct ProviderState {
    unreachable: bool,
    user: Option<ParticipantId>,
    events: Option<mpsc::UnboundedSender<ProviderEvent>>,
    channels: HashMap<ChannelUrl, StoredChannel>,
    clock: i64,
    next_message: u64,
    connect_count: usize,
    created: Vec<ChannelUrl>,
    read_marks: Vec<ChannelUrl>,
    fail_history: bool,
    fail_sends: bool,
    fail_lookups: bool,
    fail_creates: bool,
}

impl ProviderState {
    /// Monotonic millisecond clock.
    fn tick(&mut self) -> i64 {
        self.clock = Utc::now().timestamp_millis().max(self.clock + 1);
        self.clock
    }

    fn next_message_id(&mut self) -> String {
        self.next_message += 1;
        format!("msg_{:08}", self.next_message)
    }

    fn emit(&self, event: ProviderEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("no connection is listening for provider events");
            }
        }
    }

    fn unreachable() -> ProviderError {
        ProviderError::Unreachable {
            reason: "provider offline".to_string(),
        }
    }

    fn post(
        &mut self,
        url: &ChannelUrl,
        sender_id: ParticipantId,
        text: &str,
        custom_type: Option<String>,
    ) -> Result<RemoteMessage, ProviderError> {
        if !self.channels.contains_key(url) {
            return Err(ProviderError::ChannelNotFound {
                channel_url: url.to_string(),
            });
        }
        let message = RemoteMessage {
            message_id: self.next_message_id(),
            channel_url: url.clone(),
            sender_id,
            message: text.to_string(),
            custom_type,
            created_at: self.tick(),
        };
        if let Some(stored) = self.channels.get_mut(url) {
            stored.messages.push(message.clone());
        }
        Ok(message)
    }
}

/// A complete messaging provider held in memory.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
}

impl InMemoryProvider {
    /// Creates an empty, reachable provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call fail as unreachable while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Makes history loads fail.
    pub fn fail_history(&self, fail: bool) {
        self.state().fail_history = fail;
    }

    /// Makes sends fail as rejected.
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Makes channel lookups fail.
    pub fn fail_lookups(&self, fail: bool) {
        self.state().fail_lookups = fail;
    }

    /// Makes channel creation fail.
    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    /// Stores a channel without notifying anyone.
    pub fn insert_channel(&self, channel: RemoteChannel) {
        let mut state = self.state();
        state.clock = state.clock.max(channel.created_at);
        state.channels.insert(
            channel.url.clone(),
            StoredChannel {
                channel,
                messages: Vec::new(),
            },
        );
    }

    /// Stores a message in its channel's history without notifying anyone.
    ///
    /// Returns false if the channel does not exist.
    pub fn insert_message(&self, message: RemoteMessage) -> bool {
        let mut state = self.state();
        state.clock = state.clock.max(message.created_at);
        match state.channels.get_mut(&message.channel_url) {
            Some(stored) => {
                stored.messages.push(message);
                stored.messages.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.message_id.cmp(&b.message_id))
                });
                true
            }
            None => false,
        }
    }

    /// Posts a text message from the support side.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn post_support_message(
        &self,
        url: &ChannelUrl,
        text: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        self.post_as(url, ParticipantId::new(SUPPORT_SENDER), text, None)
    }

    /// Posts a classified message from the support side.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn post_notice(
        &self,
        url: &ChannelUrl,
        custom_type: &str,
        text: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        self.post_as(
            url,
            ParticipantId::new(SUPPORT_SENDER),
            text,
            Some(custom_type.to_string()),
        )
    }

    /// Posts a message as `sender_id` and delivers it to the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn post_as(
        &self,
        url: &ChannelUrl,
        sender_id: ParticipantId,
        text: &str,
        custom_type: Option<String>,
    ) -> Result<RemoteMessage, ProviderError> {
        let mut state = self.state();
        let message = state.post(url, sender_id, text, custom_type)?;
        state.emit(ProviderEvent::MessageReceived {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Changes the `status` metadata of a channel and announces the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel does not exist.
    pub fn set_channel_status(&self, url: &ChannelUrl, status: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        let Some(stored) = state.channels.get_mut(url) else {
            return Err(ProviderError::ChannelNotFound {
                channel_url: url.to_string(),
            });
        };
        stored
            .channel
            .metadata
            .insert(META_STATUS.to_string(), status.to_string());
        let channel = stored.channel.clone();
        state.emit(ProviderEvent::ChannelChanged { channel });
        Ok(())
    }

    /// Announces who is typing in a channel.
    pub fn set_typing(&self, url: &ChannelUrl, typing_member_ids: Vec<ParticipantId>) {
        self.emit(ProviderEvent::TypingStatusUpdated {
            channel_url: url.clone(),
            typing_member_ids,
        });
    }

    /// Simulates a dropped realtime connection.
    pub fn drop_connection(&self) {
        self.emit(ProviderEvent::ConnectionLost);
    }

    /// Simulates the provider reconnecting.
    pub fn restore_connection(&self) {
        self.emit(ProviderEvent::ConnectionRestored);
    }

    /// Delivers an arbitrary event to the connection.
    pub fn emit(&self, event: ProviderEvent) {
        self.state().emit(event);
    }

    /// Closes the event stream of the current connection.
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.events = None;
        state.user = None;
    }

    /// How many identity exchanges succeeded.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    /// URLs of the channels created through the provider, in order.
    #[must_use]
    pub fn created_channels(&self) -> Vec<ChannelUrl> {
        self.state().created.clone()
    }

    /// The stored history of a channel.
    #[must_use]
    pub fn messages(&self, url: &ChannelUrl) -> Vec<RemoteMessage> {
        self.state()
            .channels
            .get(url)
            .map(|stored| stored.messages.clone())
            .unwrap_or_default()
    }

    /// The stored state of a channel.
    #[must_use]
    pub fn channel(&self, url: &ChannelUrl) -> Option<RemoteChannel> {
        self.state()
            .channels
            .get(url)
            .map(|stored| stored.channel.clone())
    }

    /// Channels marked as read, in order.
    #[must_use]
    pub fn read_marks(&self) -> Vec<ChannelUrl> {
        self.state().read_marks.clone()
    }
}

#[async_trait]
impl MessagingProvider for InMemoryProvider {
    async fn connect(
        &self,
        participant_id: &ParticipantId,
        nickname: &str,
    ) -> Result<ProviderConnection, ProviderError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        if participant_id.as_str().trim().is_empty() {
            return Err(ProviderError::Rejected {
                reason: "empty user id".to_string(),
            });
        }
        let (sender, events) = mpsc::unbounded_channel();
        state.events = Some(sender);
        state.user = Some(participant_id.clone());
        state.connect_count += 1;
        Ok(ProviderConnection {
            participant_id: participant_id.clone(),
            nickname: nickname.to_string(),
            events,
        })
    }

    async fn get_channel(&self, url: &ChannelUrl) -> Result<Option<RemoteChannel>, ProviderError> {
        let state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        if state.fail_lookups {
            return Err(ProviderError::Rejected {
                reason: "lookup failed".to_string(),
            });
        }
        Ok(state.channels.get(url).map(|stored| stored.channel.clone()))
    }

    async fn create_channel(
        &self,
        params: CreateChannelParams,
    ) -> Result<RemoteChannel, ProviderError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        if state.fail_creates || state.channels.contains_key(&params.channel_url) {
            return Err(ProviderError::Rejected {
                reason: format!("cannot create channel {}", params.channel_url),
            });
        }
        let channel = RemoteChannel {
            url: params.channel_url,
            name: params.name,
            metadata: params.metadata,
            member_ids: params.member_ids,
            created_at: state.tick(),
        };
        state.created.push(channel.url.clone());
        state.channels.insert(
            channel.url.clone(),
            StoredChannel {
                channel: channel.clone(),
                messages: Vec::new(),
            },
        );
        Ok(channel)
    }

    async fn send_message(
        &self,
        url: &ChannelUrl,
        params: SendMessageParams,
    ) -> Result<RemoteMessage, ProviderError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        let Some(sender) = state.user.clone() else {
            return Err(ProviderError::Unreachable {
                reason: "not connected".to_string(),
            });
        };
        if state.fail_sends {
            return Err(ProviderError::Rejected {
                reason: "message rejected".to_string(),
            });
        }
        // Own messages are not echoed back as events.
        state.post(url, sender, &params.message, params.custom_type)
    }

    async fn load_previous_messages(
        &self,
        url: &ChannelUrl,
        limit: usize,
    ) -> Result<Vec<RemoteMessage>, ProviderError> {
        let state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        if state.fail_history {
            return Err(ProviderError::Rejected {
                reason: "history unavailable".to_string(),
            });
        }
        let Some(stored) = state.channels.get(url) else {
            return Err(ProviderError::ChannelNotFound {
                channel_url: url.to_string(),
            });
        };
        let skip = stored.messages.len().saturating_sub(limit);
        Ok(stored.messages[skip..].to_vec())
    }

    async fn mark_as_read(&self, url: &ChannelUrl) -> Result<(), ProviderError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(ProviderState::unreachable());
        }
        if !state.channels.contains_key(url) {
            return Err(ProviderError::ChannelNotFound {
                channel_url: url.to_string(),
            });
        }
        state.read_marks.push(url.clone());
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryProvider")
            .field("channels", &state.channels.len())
            .field("connected", &state.user)
            .finish_non_exhaustive()
    }
}
