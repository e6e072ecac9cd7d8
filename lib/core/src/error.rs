//! Result alias shared by the servicebell crates.
//!
//! Error enums live next to the code that raises them (`ParseIdError` here,
//! `PersistenceError` in the store, `ConnectionError` in the gateway,
//! `SendError` in the chat crate). Fallible public operations wrap them in a
//! rootcause [`Report`].

use rootcause::Report;

/// Result whose error is a rootcause [`Report`] of `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
