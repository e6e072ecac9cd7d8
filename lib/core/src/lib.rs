//! Core domain types and utilities for the servicebell support chat client.
//!
//! This crate provides the foundational types shared by the gateway, store
//! and chat crates: strongly-typed identifiers, the restaurant identity,
//! channel metadata, messages, and the persisted chat record.

pub mod channel;
pub mod error;
pub mod id;
pub mod identity;
pub mod message;
pub mod record;

pub use channel::{ChannelMetadata, ChannelStatus, TerminalStatus, UnknownStatus};
pub use error::Result;
pub use id::{ChannelUrl, MessageId, ParseIdError, ParticipantId, RestaurantId};
pub use identity::Identity;
pub use message::{Message, MessageKind};
pub use record::PersistedChatRecord;
