//! Error types for the chat crate.
//!
//! - `ChannelError`: the conversation channel could not be found or created
//! - `SendError`: a message could not be sent
//! - `SessionFailure`: why a session could not start, shown to the user

use servicebell_core::ChannelStatus;
use servicebell_gateway::ConnectionError;
use std::fmt;

/// Errors resolving the conversation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// A channel lookup failed.
    LookupFailed { channel_url: String, reason: String },
    /// Creating a new channel failed.
    CreateFailed { channel_url: String, reason: String },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LookupFailed {
                channel_url,
                reason,
            } => write!(f, "failed to look up channel {channel_url}: {reason}"),
            Self::CreateFailed {
                channel_url,
                reason,
            } => write!(f, "failed to create channel {channel_url}: {reason}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors sending a message. The conversation is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The realtime connection is down.
    Disconnected,
    /// The session has no channel yet.
    NotReady,
    /// The message is empty after trimming.
    EmptyMessage,
    /// The conversation has ended.
    ChannelTerminal { status: ChannelStatus },
    /// The provider refused the message.
    Rejected { reason: String },
    /// The session was closed.
    SessionClosed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "not connected to the support service"),
            Self::NotReady => write!(f, "the conversation is still loading"),
            Self::EmptyMessage => write!(f, "message is empty"),
            Self::ChannelTerminal { status } => write!(f, "the conversation is {status}"),
            Self::Rejected { reason } => write!(f, "message was not sent: {reason}"),
            Self::SessionClosed => write!(f, "the chat session is closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Why a session could not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// Connecting to the provider failed.
    Connection(ConnectionError),
    /// Resolving the channel failed.
    Channel(ChannelError),
    /// The session was closed before it became ready.
    Closed,
}

impl SessionFailure {
    /// Returns true if [`retry`](crate::Session::retry) may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "{e}"),
            Self::Channel(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "the chat session is closed"),
        }
    }
}

impl std::error::Error for SessionFailure {}

impl From<ConnectionError> for SessionFailure {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<ChannelError> for SessionFailure {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}
