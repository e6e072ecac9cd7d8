//! Conversation lifecycle: open, closing, terminated.
//!
//! Support ends a conversation either by changing the channel status or by
//! posting a closing notice. Either way the conversation enters `Closing`:
//! a notice is guaranteed to be part of the conversation, the channel is
//! marked terminal and written out, and after a grace delay the session ends.

use crate::config::ChatConfig;
use crate::sync::MessageSynchronizer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use servicebell_core::{ChannelMetadata, Message, MessageKind, ParticipantId, TerminalStatus};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Lifecycle state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Messages can be exchanged.
    Open,
    /// Support ended the conversation; the session ends after a grace delay.
    Closing,
    /// The session has ended.
    Terminated,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Outcome of an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed in the lifecycle.
    None,
    /// The conversation entered `Closing`.
    Closing {
        status: TerminalStatus,
        /// Whether support's own notice was part of the conversation.
        notice_delivered: bool,
    },
}

/// Drives a conversation through its lifecycle.
#[derive(Debug, Clone)]
pub struct ChannelStatusMachine {
    own_participant: ParticipantId,
    support_participant: ParticipantId,
    closed_notice_text: String,
    resolved_notice_text: String,
    grace: Duration,
    state: ConversationState,
    typing: bool,
    grace_deadline: Option<Instant>,
}

impl ChannelStatusMachine {
    /// Creates an open machine for the conversation of `own_participant`.
    #[must_use]
    pub fn new(own_participant: ParticipantId, config: &ChatConfig) -> Self {
        Self {
            own_participant,
            support_participant: config.support_participant(),
            closed_notice_text: config.closed_notice_text.clone(),
            resolved_notice_text: config.resolved_notice_text.clone(),
            grace: config.close_grace(),
            state: ConversationState::Open,
            typing: false,
            grace_deadline: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Whether someone other than the restaurant is typing.
    #[must_use]
    pub fn typing(&self) -> bool {
        self.typing
    }

    /// When the closing grace delay ends.
    #[must_use]
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    /// Observes a channel change of the adopted channel.
    pub fn on_channel_changed(
        &mut self,
        sync: &mut MessageSynchronizer,
        incoming: &ChannelMetadata,
    ) -> Transition {
        match incoming.status.terminal() {
            Some(status) if self.state == ConversationState::Open => {
                sync.absorb_channel(incoming);
                self.enter_closing(sync, status)
            }
            _ => {
                sync.update_channel(incoming);
                Transition::None
            }
        }
    }

    /// Observes a live message of the adopted channel.
    ///
    /// Returns `None` if the message was a duplicate.
    pub fn on_message(
        &mut self,
        sync: &mut MessageSynchronizer,
        message: Message,
    ) -> Option<Transition> {
        let closing = match message.kind {
            MessageKind::ClosedNotice { status } => Some(status),
            _ => None,
        };
        if !sync.append_live(message) {
            return None;
        }
        Some(match closing {
            Some(status) if self.state == ConversationState::Open => {
                self.enter_closing(sync, status)
            }
            _ => Transition::None,
        })
    }

    /// Checks a freshly loaded conversation: a terminal channel or a closing
    /// notice in the history means support already ended it.
    pub fn on_loaded(&mut self, sync: &mut MessageSynchronizer) -> Transition {
        let terminal = sync.channel().and_then(|c| c.status.terminal()).or_else(|| {
            sync.messages().iter().rev().find_map(|m| match m.kind {
                MessageKind::ClosedNotice { status } => Some(status),
                _ => None,
            })
        });
        match terminal {
            Some(status) if self.state == ConversationState::Open => {
                self.enter_closing(sync, status)
            }
            _ => Transition::None,
        }
    }

    /// Observes the members currently typing. Returns true if the indicator
    /// changed.
    pub fn on_typing(&mut self, typing_member_ids: &[ParticipantId]) -> bool {
        if self.state != ConversationState::Open {
            return false;
        }
        let typing = typing_member_ids
            .iter()
            .any(|member| *member != self.own_participant);
        let changed = typing != self.typing;
        self.typing = typing;
        changed
    }

    fn enter_closing(
        &mut self,
        sync: &mut MessageSynchronizer,
        status: TerminalStatus,
    ) -> Transition {
        let notice_delivered = sync.has_closed_notice();
        if !notice_delivered {
            let body = match status {
                TerminalStatus::Closed => &self.closed_notice_text,
                TerminalStatus::Resolved => &self.resolved_notice_text,
            };
            sync.append_live(Message::closed_notice(
                self.support_participant.clone(),
                status,
                body.as_str(),
                Utc::now(),
            ));
        }
        sync.mark_terminal(status);
        sync.flush();

        self.state = ConversationState::Closing;
        self.typing = false;
        self.grace_deadline = Some(Instant::now() + self.grace);
        Transition::Closing {
            status,
            notice_delivered,
        }
    }

    /// Ends the conversation if the grace delay is over. Returns true on the
    /// transition to `Terminated`.
    pub fn grace_expired(&mut self, now: Instant) -> bool {
        match self.grace_deadline {
            Some(deadline) if self.state == ConversationState::Closing && deadline <= now => {
                self.state = ConversationState::Terminated;
                self.grace_deadline = None;
                info!("conversation terminated");
                true
            }
            _ => false,
        }
    }

    /// Drops the pending grace timer.
    pub fn cancel(&mut self) {
        self.grace_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicebell_core::{ChannelStatus, ChannelUrl, MessageId, RestaurantId};
    use servicebell_gateway::{ConnectionGateway, InMemoryProvider};
    use servicebell_store::{MemoryBackend, PersistenceStore};
    use std::sync::Arc;

    fn channel(status: ChannelStatus) -> ChannelMetadata {
        ChannelMetadata {
            channel_url: ChannelUrl::new("support_R1"),
            name: "Support: R1".to_string(),
            status,
            priority: false,
            created_at: Utc::now(),
            restaurant_id: RestaurantId::new("R1"),
        }
    }

    fn setup() -> (PersistenceStore, MessageSynchronizer, ChannelStatusMachine) {
        let config = ChatConfig::default();
        let gateway = Arc::new(ConnectionGateway::new(Arc::new(InMemoryProvider::new())));
        let store = PersistenceStore::new(Arc::new(MemoryBackend::new()));
        let mut sync =
            MessageSynchronizer::new(gateway, store.clone(), RestaurantId::new("R1"), &config);
        sync.adopt(channel(ChannelStatus::Open));
        let machine = ChannelStatusMachine::new(ParticipantId::new("restaurant_R1"), &config);
        (store, sync, machine)
    }

    fn support_notice(status: TerminalStatus) -> Message {
        Message::new(
            MessageId::new("msg_00000009"),
            ParticipantId::new("support_router"),
            "We are closing this chat.",
            MessageKind::ClosedNotice { status },
            Utc::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_status_closes_with_synthesized_notice() {
        let (store, mut sync, mut machine) = setup();

        let transition = machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Resolved));

        assert_eq!(
            transition,
            Transition::Closing {
                status: TerminalStatus::Resolved,
                notice_delivered: false
            }
        );
        assert_eq!(machine.state(), ConversationState::Closing);
        let notice = sync.messages().last().unwrap();
        assert!(notice.id.is_local());
        assert_eq!(
            notice.kind,
            MessageKind::ClosedNotice {
                status: TerminalStatus::Resolved
            }
        );
        let stored = store.load(&RestaurantId::new("R1")).unwrap();
        assert_eq!(stored.channel_meta.status, ChannelStatus::Resolved);
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_notice_is_not_duplicated() {
        let (_store, mut sync, mut machine) = setup();

        let transition = machine
            .on_message(&mut sync, support_notice(TerminalStatus::Closed))
            .unwrap();
        assert_eq!(
            transition,
            Transition::Closing {
                status: TerminalStatus::Closed,
                notice_delivered: true
            }
        );

        let later = machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Closed));
        assert_eq!(later, Transition::None);
        assert_eq!(sync.messages().len(), 1);
        assert_eq!(sync.channel().unwrap().status, ChannelStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_message_is_reported() {
        let (_store, mut sync, mut machine) = setup();
        let notice = support_notice(TerminalStatus::Closed);

        assert!(machine.on_message(&mut sync, notice.clone()).is_some());
        assert!(machine.on_message(&mut sync, notice).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_is_ignored() {
        let (_store, mut sync, mut machine) = setup();
        machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Closed));

        machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Open));

        assert_eq!(sync.channel().unwrap().status, ChannelStatus::Closed);
        assert_eq!(machine.state(), ConversationState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_delay_leads_to_terminated() {
        let (_store, mut sync, mut machine) = setup();
        machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Closed));

        assert!(!machine.grace_expired(Instant::now()));
        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert!(!machine.grace_expired(Instant::now()));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(machine.grace_expired(Instant::now()));

        assert_eq!(machine.state(), ConversationState::Terminated);
        assert_eq!(machine.grace_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_ignores_own_participant_and_clears_on_close() {
        let (_store, mut sync, mut machine) = setup();

        assert!(!machine.on_typing(&[ParticipantId::new("restaurant_R1")]));
        assert!(!machine.typing());
        assert!(machine.on_typing(&[
            ParticipantId::new("restaurant_R1"),
            ParticipantId::new("agent_7"),
        ]));
        assert!(machine.typing());

        machine.on_channel_changed(&mut sync, &channel(ChannelStatus::Closed));
        assert!(!machine.typing());
        assert!(!machine.on_typing(&[ParticipantId::new("agent_7")]));
    }

    #[tokio::test(start_paused = true)]
    async fn already_terminal_channel_closes_on_load() {
        let (_store, mut sync, mut machine) = setup();
        sync.mark_terminal(TerminalStatus::Closed);

        let transition = machine.on_loaded(&mut sync);

        assert!(matches!(transition, Transition::Closing { .. }));
        assert!(sync.has_closed_notice());
    }

    #[tokio::test(start_paused = true)]
    async fn notice_in_history_closes_on_load() {
        let (_store, mut sync, mut machine) = setup();
        sync.merge_history(&[support_notice(TerminalStatus::Resolved)]);

        let transition = machine.on_loaded(&mut sync);

        assert_eq!(
            transition,
            Transition::Closing {
                status: TerminalStatus::Resolved,
                notice_delivered: true
            }
        );
        assert_eq!(sync.channel().unwrap().status, ChannelStatus::Resolved);
        assert_eq!(sync.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_conversation_stays_open_on_load() {
        let (_store, mut sync, mut machine) = setup();

        assert_eq!(machine.on_loaded(&mut sync), Transition::None);
        assert_eq!(machine.state(), ConversationState::Open);
    }
}
