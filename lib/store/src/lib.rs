//! Local persistence for support conversations.
//!
//! This crate provides:
//!
//! - **Key-value backends**: the synchronous `get_item`/`set_item` storage the
//!   client is embedded in, with memory and file implementations
//! - **Persistence store**: typed, best-effort load/save of
//!   [`PersistedChatRecord`](servicebell_core::PersistedChatRecord)s keyed by
//!   restaurant

pub mod backend;
pub mod error;
pub mod store;

pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use error::PersistenceError;
pub use store::PersistenceStore;
