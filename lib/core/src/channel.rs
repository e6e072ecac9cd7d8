//! Support channel metadata and lifecycle status.

use crate::id::{ChannelUrl, RestaurantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The status of a support channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// The conversation is ongoing.
    Open,
    /// Support closed the conversation.
    Closed,
    /// Support resolved the conversation.
    Resolved,
}

impl ChannelStatus {
    /// Returns true for `Closed` and `Resolved`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Returns the terminal status, if this is one.
    #[must_use]
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            Self::Open => None,
            Self::Closed => Some(TerminalStatus::Closed),
            Self::Resolved => Some(TerminalStatus::Resolved),
        }
    }

    /// Returns the provider spelling of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for a status string the client does not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel status: {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ChannelStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "resolved" => Ok(Self::Resolved),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// A status a channel never leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Support closed the conversation.
    Closed,
    /// Support resolved the conversation.
    Resolved,
}

impl From<TerminalStatus> for ChannelStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Closed => Self::Closed,
            TerminalStatus::Resolved => Self::Resolved,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ChannelStatus::from(*self).fmt(f)
    }
}

/// Cached metadata of a support channel.
///
/// The provider is the source of truth; this is the client's copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Unique channel URL.
    pub channel_url: ChannelUrl,
    /// Channel name shown to support agents.
    pub name: String,
    /// Lifecycle status.
    pub status: ChannelStatus,
    /// Whether support flagged the conversation as priority.
    pub priority: bool,
    /// When the channel was created.
    pub created_at: DateTime<Utc>,
    /// The restaurant that owns the conversation.
    pub restaurant_id: RestaurantId,
}

impl ChannelMetadata {
    /// Returns true if the channel can carry new messages.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Open
    }

    /// Moves the channel into a terminal status.
    ///
    /// Returns false if the channel was already terminal; the first terminal
    /// status sticks.
    pub fn mark_terminal(&mut self, status: TerminalStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status.into();
        true
    }

    /// Applies a newer copy of the same channel.
    ///
    /// Name and priority follow the incoming copy. The status only moves
    /// forward: an incoming `Open` never reopens a terminal channel.
    /// Returns true if anything changed.
    pub fn absorb(&mut self, incoming: &ChannelMetadata) -> bool {
        let mut changed = false;
        if self.name != incoming.name {
            self.name.clone_from(&incoming.name);
            changed = true;
        }
        if self.priority != incoming.priority {
            self.priority = incoming.priority;
            changed = true;
        }
        if let Some(terminal) = incoming.status.terminal() {
            changed |= self.mark_terminal(terminal);
        }
        changed
    }
}
