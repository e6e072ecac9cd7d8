//! Error types for the gateway crate.
//!
//! - `ProviderError`: a provider call failed
//! - `ConnectionError`: the realtime connection could not be established
//! - `ConversionError`: provider data the client cannot interpret
//! - `EventError`: an event handler failed for a single event

use servicebell_core::ParticipantId;
use std::fmt;

/// Errors reported by a messaging provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be reached.
    Unreachable { reason: String },
    /// The provider refused the request.
    Rejected { reason: String },
    /// The addressed channel does not exist.
    ChannelNotFound { channel_url: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { reason } => write!(f, "provider unreachable: {reason}"),
            Self::Rejected { reason } => write!(f, "provider rejected request: {reason}"),
            Self::ChannelNotFound { channel_url } => {
                write!(f, "channel not found: {channel_url}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors establishing the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The provider could not be reached.
    Unreachable { reason: String },
    /// The provider rejected the identity.
    Rejected {
        participant_id: ParticipantId,
        reason: String,
    },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { reason } => {
                write!(f, "cannot reach the support service: {reason}")
            }
            Self::Rejected {
                participant_id,
                reason,
            } => {
                write!(
                    f,
                    "support service rejected participant {participant_id}: {reason}"
                )
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

impl ConnectionError {
    /// Classifies a provider failure during the identity exchange.
    #[must_use]
    pub fn from_provider(participant_id: &ParticipantId, error: ProviderError) -> Self {
        match error {
            ProviderError::Unreachable { reason } => Self::Unreachable { reason },
            other => Self::Rejected {
                participant_id: participant_id.clone(),
                reason: other.to_string(),
            },
        }
    }
}

/// Provider data that cannot be turned into domain types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// A message arrived without an id.
    MissingMessageId,
    /// A timestamp was out of range.
    InvalidTimestamp { millis: i64 },
    /// A channel carried a status the client does not know.
    UnknownStatus { value: String },
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMessageId => write!(f, "message has no id"),
            Self::InvalidTimestamp { millis } => write!(f, "invalid timestamp: {millis}"),
            Self::UnknownStatus { value } => write!(f, "unknown channel status: {value:?}"),
        }
    }
}

impl std::error::Error for ConversionError {}

/// Failure of one handler on one event. Never unregisters the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event payload could not be interpreted.
    Malformed(ConversionError),
    /// Whoever consumed the handler's events has gone away.
    ReceiverGone { key: String },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed event: {e}"),
            Self::ReceiverGone { key } => write!(f, "receiver for handler '{key}' is gone"),
        }
    }
}

impl std::error::Error for EventError {}

impl From<ConversionError> for EventError {
    fn from(e: ConversionError) -> Self {
        Self::Malformed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_from_provider() {
        let participant = ParticipantId::new("restaurant_R1");
        let unreachable = ConnectionError::from_provider(
            &participant,
            ProviderError::Unreachable {
                reason: "dns".to_string(),
            },
        );
        assert!(matches!(unreachable, ConnectionError::Unreachable { .. }));

        let rejected = ConnectionError::from_provider(
            &participant,
            ProviderError::Rejected {
                reason: "banned".to_string(),
            },
        );
        assert!(rejected.to_string().contains("restaurant_R1"));
        assert!(rejected.to_string().contains("banned"));
    }

    #[test]
    fn event_error_display() {
        let err = EventError::from(ConversionError::UnknownStatus {
            value: "archived".to_string(),
        });
        assert!(err.to_string().contains("archived"));
    }
}
