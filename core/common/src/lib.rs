//! Common utilities and types shared across docmirror crates.
//!
//! This module provides the error taxonomy, identifier types and the clock
//! abstraction used by the remote client, the store and the sync engine.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorClass, Result};
pub use types::{CollectionId, Cursor, ItemId};
