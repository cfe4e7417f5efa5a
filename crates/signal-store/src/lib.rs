//! Subscribable document store used as a signaling relay.
//!
//! A store holds JSON documents keyed by id. Each document may own any number of
//! append-only collections. Both documents and collections can be watched; watchers
//! receive the current state first and every later change afterwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Top-level fields of a stored document.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionItem {
    /// Position in the collection; assigned on append and never reused.
    pub index: u64,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub kind: ChangeKind,
    pub item: CollectionItem,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store watch closed")]
    Closed,
    #[error("item {index} not found in collection {collection}")]
    ItemNotFound { collection: String, index: u64 },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Receiving end of a document or collection subscription.
///
/// Dropping the watch unsubscribes. Adapters that pump changes from a remote
/// backend hand their pump task to the watch so it is stopped on drop as well.
#[derive(Debug)]
pub struct Watch<T> {
    rx: mpsc::UnboundedReceiver<T>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl<T> Watch<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, pump: None }
    }

    #[cfg_attr(not(feature = "redis"), allow(dead_code))]
    pub(crate) fn with_pump(rx: mpsc::UnboundedReceiver<T>, pump: tokio::task::JoinHandle<()>) -> Self {
        Self {
            rx,
            pump: Some(pump),
        }
    }

    /// Waits for the next delivery. `None` means the store side went away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Whole-document watch; `None` is delivered while the document does not exist.
pub type DocumentWatch = Watch<Option<Document>>;
pub type CollectionWatch = Watch<CollectionChange>;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, doc_id: &str) -> StoreResult<Option<Document>>;

    /// Creates the document if missing, otherwise merges `fields` into it.
    async fn set(&self, doc_id: &str, fields: Document) -> StoreResult<()>;

    async fn subscribe(&self, doc_id: &str) -> StoreResult<DocumentWatch>;

    /// Appends `item` and returns its index.
    async fn append_to_collection(
        &self,
        doc_id: &str,
        collection: &str,
        item: Value,
    ) -> StoreResult<u64>;

    async fn list_collection(&self, doc_id: &str, collection: &str)
    -> StoreResult<Vec<CollectionItem>>;

    /// Existing items are delivered first as [`ChangeKind::Added`], in index order.
    async fn subscribe_collection(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> StoreResult<CollectionWatch>;
}
