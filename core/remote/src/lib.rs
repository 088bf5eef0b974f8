//! Remote store client abstraction for docmirror.
//!
//! This module provides the trait the sync engine uses to talk to the
//! remote document store, plus two implementations: an HTTP client for the
//! real service and an in-memory remote for tests and local experiments.
//!
//! # Design Principles
//! - Thin wrapper: no retry or caching here, only transport and error classification
//! - Rate limiting is enforced by the client, never by callers
//! - Errors are classified transient vs permanent at this boundary

pub mod client;
pub mod http;
pub mod memory;
pub mod rate_limit;

pub use client::{
    clamp_page_size, CollectionSchema, FieldDef, ItemPatch, Page, RemoteClient, RemoteItem,
    MAX_PAGE_SIZE,
};
pub use http::{HttpRemote, HttpRemoteConfig};
pub use memory::{InjectedFailure, MemoryRemote};
pub use rate_limit::RateLimiter;
