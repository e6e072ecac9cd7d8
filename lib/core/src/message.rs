//! Message types for support conversations.

use crate::channel::TerminalStatus;
use crate::id::{MessageId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What a message is, decided once when it enters the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Ordinary chat text.
    Text,
    /// An informational system message.
    System,
    /// The greeting that opens every new conversation.
    Welcome,
    /// Support ended the conversation.
    ClosedNotice {
        /// How the conversation ended.
        status: TerminalStatus,
    },
}

impl MessageKind {
    /// Returns true if the message announces the end of the conversation.
    #[must_use]
    pub fn is_closed_notice(&self) -> bool {
        matches!(self, Self::ClosedNotice { .. })
    }

    /// Returns true if the UI renders this as a system banner rather than a
    /// chat bubble.
    #[must_use]
    pub fn is_system_styled(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

/// A message in a support conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Provider-assigned identifier, or a local one for synthesized messages.
    pub id: MessageId,
    /// Who sent the message.
    pub sender_id: ParticipantId,
    /// Message text.
    pub body: String,
    /// Message kind.
    pub kind: MessageKind,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message.
    #[must_use]
    pub fn new(
        id: MessageId,
        sender_id: ParticipantId,
        body: impl Into<String>,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender_id,
            body: body.into(),
            kind,
            created_at,
        }
    }

    /// Synthesizes a closing notice on the client.
    #[must_use]
    pub fn closed_notice(
        sender_id: ParticipantId,
        status: TerminalStatus,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            MessageId::local(),
            sender_id,
            body,
            MessageKind::ClosedNotice { status },
            created_at,
        )
    }

    /// Total order of a conversation: by creation time, then by id.
    #[must_use]
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}
