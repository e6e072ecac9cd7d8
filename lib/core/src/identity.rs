//! The identity a restaurant uses on the messaging provider.

use crate::id::{ParticipantId, RestaurantId};
use serde::{Deserialize, Serialize};

/// Who is talking to support. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    restaurant_id: RestaurantId,
    participant_id: ParticipantId,
    display_name: String,
}

impl Identity {
    /// Creates the identity of a restaurant; the participant id is derived
    /// from the restaurant id.
    #[must_use]
    pub fn new(restaurant_id: RestaurantId, display_name: impl Into<String>) -> Self {
        let participant_id = ParticipantId::for_restaurant(&restaurant_id);
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            restaurant_id.to_string()
        } else {
            display_name
        };
        Self {
            restaurant_id,
            participant_id,
            display_name,
        }
    }

    /// Returns the restaurant id.
    #[must_use]
    pub fn restaurant_id(&self) -> &RestaurantId {
        &self.restaurant_id
    }

    /// Returns the provider participant id.
    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Returns the name shown to support agents.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_derives_participant() {
        let identity = Identity::new(RestaurantId::new("R1"), "Trattoria Uno");
        assert_eq!(identity.participant_id().as_str(), "restaurant_R1");
        assert_eq!(identity.display_name(), "Trattoria Uno");
    }

    #[test]
    fn blank_display_name_falls_back_to_restaurant_id() {
        let identity = Identity::new(RestaurantId::new("R2"), "  ");
        assert_eq!(identity.display_name(), "R2");
    }
}
