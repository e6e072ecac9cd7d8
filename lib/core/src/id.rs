//! Strongly-typed identifiers for support chat entities.
//!
//! The messaging provider addresses everything by opaque strings, so every
//! identifier wraps a `String`. Participant ids and channel URLs are derived
//! deterministically from the restaurant id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Prefix of the provider participant that represents a restaurant.
const PARTICIPANT_PREFIX: &str = "restaurant_";

/// Prefix of every support channel URL.
const CHANNEL_PREFIX: &str = "support_";

/// Prefix of message ids synthesized locally rather than by the provider.
const LOCAL_MESSAGE_PREFIX: &str = "local_";

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed wrapper around a provider string id.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(ParseIdError {
                        id_type: stringify!($name),
                        reason: "identifier is empty".to_string(),
                    });
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of a restaurant, as known to the dashboard.
    RestaurantId
);

define_id!(
    /// Identifier of a participant (user) on the messaging provider.
    ParticipantId
);

define_id!(
    /// Unique URL of a provider channel.
    ChannelUrl
);

define_id!(
    /// Identifier of a message, unique within its channel.
    MessageId
);

impl ParticipantId {
    /// Derives the provider participant for a restaurant.
    #[must_use]
    pub fn for_restaurant(restaurant_id: &RestaurantId) -> Self {
        Self(format!("{PARTICIPANT_PREFIX}{restaurant_id}"))
    }
}

impl ChannelUrl {
    /// The canonical slot: the deterministic channel URL for a restaurant.
    #[must_use]
    pub fn canonical(restaurant_id: &RestaurantId) -> Self {
        Self(format!("{CHANNEL_PREFIX}{restaurant_id}"))
    }

    /// A globally unique channel URL, suffixed with the creation time.
    #[must_use]
    pub fn timestamped(restaurant_id: &RestaurantId, created_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{CHANNEL_PREFIX}{restaurant_id}_{}",
            created_at.timestamp_millis()
        ))
    }

    /// Returns true if this URL is the canonical slot or a timestamped
    /// channel of the given restaurant.
    #[must_use]
    pub fn belongs_to(&self, restaurant_id: &RestaurantId) -> bool {
        let canonical = Self::canonical(restaurant_id);
        match self.0.strip_prefix(canonical.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('_')
                .is_some_and(|millis| !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }
}

impl MessageId {
    /// Creates an id for a message synthesized on this client.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_PREFIX}{}", Ulid::new()))
    }

    /// Returns true if this message never came from the provider.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn participant_is_derived_from_restaurant() {
        let restaurant = RestaurantId::new("R1");
        assert_eq!(
            ParticipantId::for_restaurant(&restaurant).as_str(),
            "restaurant_R1"
        );
        assert_eq!(
            ParticipantId::for_restaurant(&restaurant),
            ParticipantId::for_restaurant(&RestaurantId::new("R1"))
        );
    }

    #[test]
    fn timestamped_url_is_suffixed_with_millis() {
        let restaurant = RestaurantId::new("R1");
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let url = ChannelUrl::timestamped(&restaurant, at);
        assert_eq!(url.as_str(), "support_R1_1700000000123");
        assert_ne!(url, ChannelUrl::canonical(&restaurant));
    }

    #[test]
    fn belongs_to_matches_only_own_channels() {
        let r1 = RestaurantId::new("R1");
        let at = Utc.timestamp_millis_opt(42).unwrap();
        assert!(ChannelUrl::canonical(&r1).belongs_to(&r1));
        assert!(ChannelUrl::timestamped(&r1, at).belongs_to(&r1));
        assert!(!ChannelUrl::canonical(&RestaurantId::new("R10")).belongs_to(&r1));
        assert!(!ChannelUrl::new("support_R1_abc").belongs_to(&r1));
    }

    #[test]
    fn parse_rejects_blank() {
        let result: Result<RestaurantId, _> = "   ".parse();
        let err = result.unwrap_err();
        assert_eq!(err.id_type, "RestaurantId");
        assert!(err.to_string().contains("empty"));

        let parsed: RestaurantId = " R7 ".parse().expect("should parse");
        assert_eq!(parsed.as_str(), "R7");
    }

    #[test]
    fn local_message_ids_are_unique() {
        let a = MessageId::local();
        let b = MessageId::local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!MessageId::new("msg_00000001").is_local());
    }

    #[test]
    fn id_serializes_transparently() {
        let id = ChannelUrl::new("support_R1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"support_R1\"");
    }
}
