//! Connection to the realtime messaging provider.
//!
//! This crate provides:
//!
//! - **Provider**: the [`MessagingProvider`] trait the support chat talks to,
//!   and the raw channel/message/event shapes it exchanges
//! - **Conversion**: the boundary where provider strings become
//!   [`MessageKind`](servicebell_core::MessageKind) and
//!   [`ChannelStatus`](servicebell_core::ChannelStatus)
//! - **Gateway**: the single shared connection with keyed event handlers
//! - **In-memory provider**: a complete provider for tests and local use

pub mod convert;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod provider;

pub use error::{ConnectionError, ConversionError, EventError, ProviderError};
pub use gateway::{ConnectedIdentity, ConnectionGateway, EventHandler, Registration};
pub use memory::InMemoryProvider;
pub use provider::{
    CreateChannelParams, MessagingProvider, ProviderConnection, ProviderEvent, RemoteChannel,
    RemoteMessage, SendMessageParams,
};
