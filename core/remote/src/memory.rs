//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use docmirror_common::{CollectionId, Cursor, Error, ItemId, Result};

use crate::client::{clamp_page_size, CollectionSchema, ItemPatch, Page, RemoteClient, RemoteItem};

/// Failure to inject into the next call(s) of [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFailure {
    /// 5xx from the server.
    Server(u16),
    /// Call never completed.
    Timeout,
    /// 429 with an optional hint.
    RateLimited(Option<Duration>),
    /// 404.
    NotFound,
    /// 401.
    Unauthorized,
}

impl InjectedFailure {
    fn to_error(&self, what: &str) -> Error {
        match self {
            InjectedFailure::Server(status) => Error::Server {
                status: *status,
                message: format!("injected failure for {}", what),
            },
            InjectedFailure::Timeout => Error::Timeout(Duration::from_secs(30)),
            InjectedFailure::RateLimited(retry_after) => Error::RateLimited {
                retry_after: *retry_after,
            },
            InjectedFailure::NotFound => Error::NotFound(what.to_string()),
            InjectedFailure::Unauthorized => Error::Authentication("token rejected".to_string()),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    /// Item ids per collection, in listing order.
    collections: HashMap<CollectionId, Vec<ItemId>>,
    items: HashMap<ItemId, RemoteItem>,
    schemas: HashMap<CollectionId, CollectionSchema>,
    listing_failures: HashMap<CollectionId, VecDeque<InjectedFailure>>,
    item_failures: HashMap<ItemId, VecDeque<InjectedFailure>>,
    listing_delay: HashMap<CollectionId, Duration>,
    listing_calls: HashMap<CollectionId, u32>,
    item_calls: HashMap<ItemId, u32>,
    write_calls: u32,
}

/// In-memory remote store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Listings return items without content, like the real
/// API; `fetch_item` returns the full item.
pub struct MemoryRemote {
    state: RwLock<MemoryState>,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty collection with the given schema.
    pub fn create_collection(&self, collection: &CollectionId, schema: CollectionSchema) {
        let mut state = self.write();
        state.collections.entry(collection.clone()).or_default();
        state.schemas.insert(collection.clone(), schema);
    }

    /// Create or replace an item, as if edited on the remote side.
    pub fn put_item(
        &self,
        collection: &CollectionId,
        item: &ItemId,
        properties: Map<String, Value>,
        content: Option<&str>,
    ) -> RemoteItem {
        let mut state = self.write();
        let previous = state.items.get(item).map(|i| i.last_edited);
        let remote_item = RemoteItem {
            id: item.clone(),
            collection_id: collection.clone(),
            properties,
            content: content.map(String::from),
            last_edited: next_edit_time(previous),
            archived: false,
        };

        let ids = state.collections.entry(collection.clone()).or_default();
        if !ids.contains(item) {
            ids.push(item.clone());
        }
        state.items.insert(item.clone(), remote_item.clone());
        remote_item
    }

    /// Edit an existing item on the remote side.
    pub fn edit_item(&self, item: &ItemId, patch: &ItemPatch) -> Result<RemoteItem> {
        let mut state = self.write();
        let existing = state
            .items
            .get_mut(item)
            .ok_or_else(|| Error::NotFound(item.to_string()))?;
        patch.apply_to(&mut existing.properties, &mut existing.content);
        existing.last_edited = next_edit_time(Some(existing.last_edited));
        Ok(existing.clone())
    }

    /// Mark an item as removed. It stays in listings with `archived` set.
    pub fn archive_item(&self, item: &ItemId) -> Result<()> {
        let mut state = self.write();
        let existing = state
            .items
            .get_mut(item)
            .ok_or_else(|| Error::NotFound(item.to_string()))?;
        existing.archived = true;
        existing.last_edited = next_edit_time(Some(existing.last_edited));
        Ok(())
    }

    /// Remove an item entirely, so it disappears from listings.
    pub fn delete_item(&self, item: &ItemId) {
        let mut state = self.write();
        if let Some(removed) = state.items.remove(item) {
            if let Some(ids) = state.collections.get_mut(&removed.collection_id) {
                ids.retain(|id| id != item);
            }
        }
    }

    /// Make the next `times` listing calls for a collection fail.
    pub fn fail_listing(&self, collection: &CollectionId, failure: InjectedFailure, times: usize) {
        let mut state = self.write();
        let queue = state.listing_failures.entry(collection.clone()).or_default();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    /// Make the next `times` calls touching an item fail.
    pub fn fail_item(&self, item: &ItemId, failure: InjectedFailure, times: usize) {
        let mut state = self.write();
        let queue = state.item_failures.entry(item.clone()).or_default();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    /// Slow down every listing call of a collection.
    pub fn set_listing_delay(&self, collection: &CollectionId, delay: Duration) {
        self.write().listing_delay.insert(collection.clone(), delay);
    }

    /// Number of listing calls made for a collection.
    pub fn listing_calls(&self, collection: &CollectionId) -> u32 {
        self.read().listing_calls.get(collection).copied().unwrap_or(0)
    }

    /// Number of fetch/write calls made for an item.
    pub fn item_calls(&self, item: &ItemId) -> u32 {
        self.read().item_calls.get(item).copied().unwrap_or(0)
    }

    /// Number of successful writes.
    pub fn write_calls(&self) -> u32 {
        self.read().write_calls
    }

    /// Current remote state of an item.
    pub fn item(&self, item: &ItemId) -> Option<RemoteItem> {
        self.read().items.get(item).cloned()
    }

    fn take_item_failure(&self, item: &ItemId) -> Option<Error> {
        let mut state = self.write();
        *state.item_calls.entry(item.clone()).or_insert(0) += 1;
        state
            .item_failures
            .get_mut(item)
            .and_then(|q| q.pop_front())
            .map(|f| f.to_error(item.as_str()))
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

/// Next "last edited" timestamp, strictly after the previous one.
fn next_edit_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + ChronoDuration::milliseconds(1),
        _ => now,
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_page(
        &self,
        collection: &CollectionId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page> {
        let (failure, delay) = {
            let mut state = self.write();
            *state.listing_calls.entry(collection.clone()).or_insert(0) += 1;
            let failure = state
                .listing_failures
                .get_mut(collection)
                .and_then(|q| q.pop_front());
            (failure, state.listing_delay.get(collection).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = failure {
            return Err(failure.to_error(collection.as_str()));
        }

        let offset = match cursor {
            Some(c) => c
                .as_str()
                .parse::<usize>()
                .map_err(|_| Error::InvalidInput(format!("Invalid cursor {}", c.as_str())))?,
            None => 0,
        };
        let page_size = clamp_page_size(page_size);

        let state = self.read();
        let ids = state
            .collections
            .get(collection)
            .ok_or_else(|| Error::NotFound(format!("Collection {}", collection)))?;

        let items = ids
            .iter()
            .skip(offset)
            .take(page_size)
            .filter_map(|id| state.items.get(id))
            .map(|item| RemoteItem {
                content: None,
                ..item.clone()
            })
            .collect();

        let next = offset + page_size;
        let next_cursor = (next < ids.len()).then(|| Cursor::new(next.to_string()));

        Ok(Page { items, next_cursor })
    }

    async fn fetch_item(&self, item: &ItemId) -> Result<RemoteItem> {
        if let Some(err) = self.take_item_failure(item) {
            return Err(err);
        }
        self.read()
            .items
            .get(item)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Item {}", item)))
    }

    async fn write_item(&self, item: &ItemId, patch: &ItemPatch) -> Result<RemoteItem> {
        if let Some(err) = self.take_item_failure(item) {
            return Err(err);
        }
        let updated = self.edit_item(item, patch)?;
        self.write().write_calls += 1;
        Ok(updated)
    }

    async fn fetch_schema(&self, collection: &CollectionId) -> Result<CollectionSchema> {
        self.read()
            .schemas
            .get(collection)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Schema for {}", collection)))
    }
}
