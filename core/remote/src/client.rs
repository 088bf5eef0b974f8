//! Remote client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use docmirror_common::{CollectionId, Cursor, ItemId, Result};

/// Largest page the remote API will hand out.
pub const MAX_PAGE_SIZE: usize = 100;

/// Clamp a requested page size into the range the remote accepts.
pub fn clamp_page_size(requested: usize) -> usize {
    requested.clamp(1, MAX_PAGE_SIZE)
}

/// A record as the remote store describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Remote item identifier.
    pub id: ItemId,
    /// Collection the item belongs to.
    pub collection_id: CollectionId,
    /// Property set.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Content body. Listings may leave this out; `fetch_item` fills it in.
    #[serde(default)]
    pub content: Option<String>,
    /// The remote's own "last edited" timestamp.
    pub last_edited: DateTime<Utc>,
    /// Whether the remote marks this item as removed.
    #[serde(default)]
    pub archived: bool,
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<RemoteItem>,
    /// Cursor for the next page, `None` when the listing is exhausted.
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
}

/// Partial update of a remote item.
///
/// Property values of `null` remove the property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ItemPatch {
    /// Set a property value.
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Replace the content body.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.content.is_none()
    }

    /// Apply this patch to a property set and content body.
    pub fn apply_to(&self, properties: &mut Map<String, Value>, content: &mut Option<String>) {
        for (name, value) in &self.properties {
            if value.is_null() {
                properties.remove(name);
            } else {
                properties.insert(name.clone(), value.clone());
            }
        }
        if let Some(body) = &self.content {
            *content = Some(body.clone());
        }
    }
}

/// Field definition of a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

/// Field definitions of a remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// Client for the remote document store.
///
/// Implementations classify failures into transient and permanent errors
/// and enforce the remote's rate limit themselves.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get the client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Fetch one page of a collection.
    ///
    /// # Preconditions
    /// - `cursor` is `None` for the first page, otherwise the value returned
    ///   by the previous page, unchanged
    /// - `page_size` is clamped to [`MAX_PAGE_SIZE`]
    ///
    /// # Errors
    /// - Collection not found
    /// - Network/timeout/rate-limit errors (transient)
    async fn fetch_page(
        &self,
        collection: &CollectionId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> Result<Page>;

    /// Fetch a single item including its content body.
    async fn fetch_item(&self, item: &ItemId) -> Result<RemoteItem>;

    /// Apply a patch to an item and return its new state.
    async fn write_item(&self, item: &ItemId, patch: &ItemPatch) -> Result<RemoteItem>;

    /// Fetch the field definitions of a collection.
    async fn fetch_schema(&self, collection: &CollectionId) -> Result<CollectionSchema>;
}
