//! Support chat session manager for the restaurant dashboard.
//!
//! This crate provides:
//!
//! - **Configuration**: [`ChatConfig`], loaded from `SUPPORT_CHAT_*`
//!   environment variables
//! - **Channel resolution**: one active support channel per restaurant
//! - **Synchronization**: merging provider history with the local cache and
//!   scheduling persistence
//! - **Lifecycle**: detecting when support closes a conversation
//! - **Sessions**: the entry point, [`SessionController::open`]

pub mod config;
pub mod error;
pub mod resolver;
pub mod session;
pub mod status;
pub mod sync;

pub use config::ChatConfig;
pub use error::{ChannelError, SendError, SessionFailure};
pub use resolver::ChannelResolver;
pub use session::{ChatView, OnClose, Session, SessionController, handler_key};
pub use status::{ChannelStatusMachine, ConversationState, Transition};
pub use sync::{FlushSlot, MessageLog, MessageSynchronizer, PendingWrite, merge};
