//! Translation between provider shapes and domain types.
//!
//! Provider strings are interpreted here and nowhere else.

use crate::error::ConversionError;
use crate::provider::{RemoteChannel, RemoteMessage};
use chrono::{DateTime, Utc};
use servicebell_core::{
    ChannelMetadata, ChannelStatus, Message, MessageId, MessageKind, RestaurantId, TerminalStatus,
};
use std::collections::HashMap;

/// `custom_type` of the greeting that opens a conversation.
pub const CUSTOM_TYPE_WELCOME: &str = "welcome";
/// `custom_type` of informational system messages.
pub const CUSTOM_TYPE_SYSTEM: &str = "system";
/// `custom_type` of the notice support posts when closing a conversation.
pub const CUSTOM_TYPE_CLOSED: &str = "channel_closed";
/// `custom_type` of the notice support posts when resolving a conversation.
pub const CUSTOM_TYPE_RESOLVED: &str = "channel_resolved";

/// Channel metadata key holding the status.
pub const META_STATUS: &str = "status";
/// Channel metadata key holding the priority flag.
pub const META_PRIORITY: &str = "priority";
/// Channel metadata key holding the owning restaurant.
pub const META_RESTAURANT: &str = "restaurant_id";

/// Decides what a message is from its provider `custom_type`.
///
/// Unknown types are treated as plain text.
#[must_use]
pub fn message_kind(custom_type: Option<&str>) -> MessageKind {
    match custom_type.map(str::trim).unwrap_or_default() {
        CUSTOM_TYPE_WELCOME => MessageKind::Welcome,
        CUSTOM_TYPE_SYSTEM => MessageKind::System,
        CUSTOM_TYPE_CLOSED => MessageKind::ClosedNotice {
            status: TerminalStatus::Closed,
        },
        CUSTOM_TYPE_RESOLVED => MessageKind::ClosedNotice {
            status: TerminalStatus::Resolved,
        },
        _ => MessageKind::Text,
    }
}

/// The provider `custom_type` for a message kind.
#[must_use]
pub fn custom_type(kind: &MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::Text => None,
        MessageKind::System => Some(CUSTOM_TYPE_SYSTEM),
        MessageKind::Welcome => Some(CUSTOM_TYPE_WELCOME),
        MessageKind::ClosedNotice {
            status: TerminalStatus::Closed,
        } => Some(CUSTOM_TYPE_CLOSED),
        MessageKind::ClosedNotice {
            status: TerminalStatus::Resolved,
        } => Some(CUSTOM_TYPE_RESOLVED),
    }
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, ConversionError> {
    DateTime::from_timestamp_millis(millis).ok_or(ConversionError::InvalidTimestamp { millis })
}

/// Converts a provider message.
///
/// # Errors
///
/// Returns an error if the message has no id or an invalid timestamp.
pub fn message_from_remote(remote: &RemoteMessage) -> Result<Message, ConversionError> {
    if remote.message_id.trim().is_empty() {
        return Err(ConversionError::MissingMessageId);
    }
    Ok(Message::new(
        MessageId::new(remote.message_id.clone()),
        remote.sender_id.clone(),
        remote.message.clone(),
        message_kind(remote.custom_type.as_deref()),
        timestamp(remote.created_at)?,
    ))
}

/// Converts a provider channel.
///
/// A missing status means the channel is open; a missing restaurant is
/// recovered from the channel URL.
///
/// # Errors
///
/// Returns an error for an unknown status or an invalid timestamp.
pub fn channel_from_remote(remote: &RemoteChannel) -> Result<ChannelMetadata, ConversionError> {
    let status = match remote.metadata.get(META_STATUS) {
        Some(value) => value
            .parse::<ChannelStatus>()
            .map_err(|_| ConversionError::UnknownStatus {
                value: value.clone(),
            })?,
        None => ChannelStatus::Open,
    };
    let priority = remote
        .metadata
        .get(META_PRIORITY)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));
    let restaurant_id = match remote.metadata.get(META_RESTAURANT) {
        Some(id) => RestaurantId::new(id.clone()),
        None => restaurant_from_url(remote),
    };

    Ok(ChannelMetadata {
        channel_url: remote.url.clone(),
        name: remote.name.clone(),
        status,
        priority,
        created_at: timestamp(remote.created_at)?,
        restaurant_id,
    })
}

fn restaurant_from_url(remote: &RemoteChannel) -> RestaurantId {
    let rest = remote
        .url
        .as_str()
        .strip_prefix("support_")
        .unwrap_or(remote.url.as_str());
    let id = match rest.rsplit_once('_') {
        Some((id, millis)) if !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit()) => id,
        _ => rest,
    };
    RestaurantId::new(id)
}

/// Metadata written on a freshly created channel.
#[must_use]
pub fn channel_metadata_fields(restaurant_id: &RestaurantId) -> HashMap<String, String> {
    HashMap::from([
        (META_STATUS.to_string(), ChannelStatus::Open.as_str().to_string()),
        (META_PRIORITY.to_string(), "false".to_string()),
        (META_RESTAURANT.to_string(), restaurant_id.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use servicebell_core::{ChannelUrl, ParticipantId};

    fn remote_message(custom_type: Option<&str>) -> RemoteMessage {
        RemoteMessage {
            message_id: "msg_00000001".to_string(),
            channel_url: ChannelUrl::new("support_R1"),
            sender_id: ParticipantId::new("support_router"),
            message: "hello".to_string(),
            custom_type: custom_type.map(str::to_string),
            created_at: 1_700_000_000_000,
        }
    }

    fn remote_channel(metadata: &[(&str, &str)]) -> RemoteChannel {
        RemoteChannel {
            url: ChannelUrl::new("support_R1_1700000000000"),
            name: "Support: R1".to_string(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            member_ids: vec![],
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn custom_types_classify_once() {
        assert_eq!(message_kind(None), MessageKind::Text);
        assert_eq!(message_kind(Some("")), MessageKind::Text);
        assert_eq!(message_kind(Some("promo")), MessageKind::Text);
        assert_eq!(message_kind(Some("welcome")), MessageKind::Welcome);
        assert_eq!(message_kind(Some("system")), MessageKind::System);
        assert_eq!(
            message_kind(Some("channel_resolved")),
            MessageKind::ClosedNotice {
                status: TerminalStatus::Resolved
            }
        );
    }

    #[test]
    fn custom_type_roundtrips_through_kind() {
        for kind in [
            MessageKind::Text,
            MessageKind::System,
            MessageKind::Welcome,
            MessageKind::ClosedNotice {
                status: TerminalStatus::Closed,
            },
            MessageKind::ClosedNotice {
                status: TerminalStatus::Resolved,
            },
        ] {
            assert_eq!(message_kind(custom_type(&kind)), kind);
        }
    }

    #[test]
    fn message_conversion() {
        let message = message_from_remote(&remote_message(Some("channel_closed"))).unwrap();
        assert_eq!(message.id.as_str(), "msg_00000001");
        assert!(message.kind.is_closed_notice());
        assert_eq!(message.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn message_without_id_is_malformed() {
        let mut remote = remote_message(None);
        remote.message_id = " ".to_string();
        assert_eq!(
            message_from_remote(&remote),
            Err(ConversionError::MissingMessageId)
        );
    }

    #[test]
    fn channel_conversion_reads_metadata() {
        let meta = channel_from_remote(&remote_channel(&[
            ("status", "Resolved"),
            ("priority", "true"),
            ("restaurant_id", "R1"),
        ]))
        .unwrap();
        assert_eq!(meta.status, ChannelStatus::Resolved);
        assert!(meta.priority);
        assert_eq!(meta.restaurant_id.as_str(), "R1");
    }

    #[test]
    fn channel_conversion_defaults() {
        let meta = channel_from_remote(&remote_channel(&[])).unwrap();
        assert_eq!(meta.status, ChannelStatus::Open);
        assert!(!meta.priority);
        assert_eq!(meta.restaurant_id.as_str(), "R1");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = channel_from_remote(&remote_channel(&[("status", "archived")])).unwrap_err();
        assert_eq!(
            err,
            ConversionError::UnknownStatus {
                value: "archived".to_string()
            }
        );
    }

    #[test]
    fn created_channel_fields() {
        let fields = channel_metadata_fields(&RestaurantId::new("R9"));
        assert_eq!(fields.get(META_STATUS).map(String::as_str), Some("open"));
        assert_eq!(fields.get(META_PRIORITY).map(String::as_str), Some("false"));
        assert_eq!(fields.get(META_RESTAURANT).map(String::as_str), Some("R9"));
    }
}
