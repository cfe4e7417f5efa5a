use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    ChangeKind, CollectionChange, CollectionItem, CollectionWatch, Document, DocumentWatch,
    SharedStore, StoreError, StoreResult, Watch,
};

#[derive(Default)]
struct DocumentEntry {
    fields: Option<Document>,
    watchers: Vec<mpsc::UnboundedSender<Option<Document>>>,
    collections: HashMap<String, CollectionEntry>,
}

#[derive(Default)]
struct CollectionEntry {
    /// Removed items leave a hole so indices stay stable.
    items: Vec<Option<Value>>,
    watchers: Vec<mpsc::UnboundedSender<CollectionChange>>,
}

impl CollectionEntry {
    fn notify(&mut self, change: CollectionChange) {
        self.watchers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// In-process store for tests, demos and single-process sessions.
///
/// Notifications are sent while the write lock is held, so every watcher observes
/// changes in the same order they were applied.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, DocumentEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing collection item and emits [`ChangeKind::Modified`].
    pub fn update_item(
        &self,
        doc_id: &str,
        collection: &str,
        index: u64,
        value: Value,
    ) -> StoreResult<()> {
        let mut guard = self.documents.write();
        let entry = guard
            .get_mut(doc_id)
            .and_then(|doc| doc.collections.get_mut(collection))
            .ok_or_else(|| not_found(collection, index))?;
        let slot = entry
            .items
            .get_mut(index as usize)
            .filter(|slot| slot.is_some())
            .ok_or_else(|| not_found(collection, index))?;
        *slot = Some(value.clone());
        entry.notify(CollectionChange {
            kind: ChangeKind::Modified,
            item: CollectionItem { index, value },
        });
        Ok(())
    }

    /// Removes a collection item and emits [`ChangeKind::Removed`] carrying its last value.
    pub fn remove_item(&self, doc_id: &str, collection: &str, index: u64) -> StoreResult<()> {
        let mut guard = self.documents.write();
        let entry = guard
            .get_mut(doc_id)
            .and_then(|doc| doc.collections.get_mut(collection))
            .ok_or_else(|| not_found(collection, index))?;
        let value = entry
            .items
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or_else(|| not_found(collection, index))?;
        entry.notify(CollectionChange {
            kind: ChangeKind::Removed,
            item: CollectionItem { index, value },
        });
        Ok(())
    }

    /// Number of live watchers on a document and its collections.
    pub fn active_watchers(&self, doc_id: &str) -> usize {
        let guard = self.documents.read();
        let Some(entry) = guard.get(doc_id) else {
            return 0;
        };
        let doc_watchers = entry.watchers.iter().filter(|tx| !tx.is_closed()).count();
        let collection_watchers: usize = entry
            .collections
            .values()
            .map(|collection| collection.watchers.iter().filter(|tx| !tx.is_closed()).count())
            .sum();
        doc_watchers + collection_watchers
    }
}

fn not_found(collection: &str, index: u64) -> StoreError {
    StoreError::ItemNotFound {
        collection: collection.to_string(),
        index,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        let guard = self.documents.read();
        Ok(guard.get(doc_id).and_then(|entry| entry.fields.clone()))
    }

    async fn set(&self, doc_id: &str, fields: Document) -> StoreResult<()> {
        let mut guard = self.documents.write();
        let entry = guard.entry(doc_id.to_string()).or_default();
        let document = entry.fields.get_or_insert_with(Document::new);
        for (key, value) in fields {
            document.insert(key, value);
        }
        let snapshot = entry.fields.clone();
        entry
            .watchers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self, doc_id: &str) -> StoreResult<DocumentWatch> {
        let mut guard = self.documents.write();
        let entry = guard.entry(doc_id.to_string()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(entry.fields.clone())
            .map_err(|_| StoreError::Closed)?;
        entry.watchers.push(tx);
        Ok(Watch::new(rx))
    }

    async fn append_to_collection(
        &self,
        doc_id: &str,
        collection: &str,
        item: Value,
    ) -> StoreResult<u64> {
        let mut guard = self.documents.write();
        let entry = guard
            .entry(doc_id.to_string())
            .or_default()
            .collections
            .entry(collection.to_string())
            .or_default();
        let index = entry.items.len() as u64;
        entry.items.push(Some(item.clone()));
        entry.notify(CollectionChange {
            kind: ChangeKind::Added,
            item: CollectionItem { index, value: item },
        });
        Ok(index)
    }

    async fn list_collection(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> StoreResult<Vec<CollectionItem>> {
        let guard = self.documents.read();
        let items = guard
            .get(doc_id)
            .and_then(|doc| doc.collections.get(collection))
            .map(|entry| live_items(&entry.items))
            .unwrap_or_default();
        Ok(items)
    }

    async fn subscribe_collection(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> StoreResult<CollectionWatch> {
        let mut guard = self.documents.write();
        let entry = guard
            .entry(doc_id.to_string())
            .or_default()
            .collections
            .entry(collection.to_string())
            .or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        for item in live_items(&entry.items) {
            tx.send(CollectionChange {
                kind: ChangeKind::Added,
                item,
            })
            .map_err(|_| StoreError::Closed)?;
        }
        entry.watchers.push(tx);
        Ok(Watch::new(rx))
    }
}

fn live_items(items: &[Option<Value>]) -> Vec<CollectionItem> {
    items
        .iter()
        .enumerate()
        .filter_map(|(index, value)| {
            value.as_ref().map(|value| CollectionItem {
                index: index as u64,
                value: value.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Document {
        value.as_object().cloned().expect("object literal")
    }

    #[tokio::test]
    async fn set_creates_then_merges() {
        let store = MemoryStore::new();
        assert!(store.get("call").await.expect("get").is_none());

        store
            .set("call", fields(json!({ "offer": { "type": "offer" } })))
            .await
            .expect("create");
        store
            .set("call", fields(json!({ "answer": { "type": "answer" } })))
            .await
            .expect("merge");

        let doc = store.get("call").await.expect("get").expect("exists");
        assert!(doc.contains_key("offer"));
        assert!(doc.contains_key("answer"));
    }

    #[tokio::test]
    async fn document_watch_delivers_current_state_first() {
        let store = MemoryStore::new();
        let mut watch = store.subscribe("call").await.expect("subscribe");
        assert_eq!(watch.next().await, Some(None));

        store
            .set("call", fields(json!({ "offer": "o" })))
            .await
            .expect("set");
        let delivered = watch.next().await.expect("delivery").expect("document");
        assert_eq!(delivered.get("offer"), Some(&json!("o")));
    }

    #[tokio::test]
    async fn collection_watch_replays_existing_items_then_changes() {
        let store = MemoryStore::new();
        store
            .append_to_collection("call", "offerCandidates", json!("c0"))
            .await
            .expect("append");
        let mut watch = store
            .subscribe_collection("call", "offerCandidates")
            .await
            .expect("subscribe");
        store
            .append_to_collection("call", "offerCandidates", json!("c1"))
            .await
            .expect("append");
        store
            .update_item("call", "offerCandidates", 0, json!("c0*"))
            .expect("update");
        store
            .remove_item("call", "offerCandidates", 1)
            .expect("remove");

        let kinds: Vec<(ChangeKind, u64)> = std::iter::from_fn(|| watch.try_next())
            .map(|change| (change.kind, change.item.index))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Added, 0),
                (ChangeKind::Added, 1),
                (ChangeKind::Modified, 0),
                (ChangeKind::Removed, 1),
            ]
        );

        let remaining = store
            .list_collection("call", "offerCandidates")
            .await
            .expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].value, json!("c0*"));
    }

    #[tokio::test]
    async fn dropped_watch_is_pruned() {
        let store = MemoryStore::new();
        let doc_watch = store.subscribe("call").await.expect("subscribe");
        let col_watch = store
            .subscribe_collection("call", "answerCandidates")
            .await
            .expect("subscribe");
        assert_eq!(store.active_watchers("call"), 2);

        drop(doc_watch);
        drop(col_watch);
        assert_eq!(store.active_watchers("call"), 0);

        store
            .append_to_collection("call", "answerCandidates", json!("late"))
            .await
            .expect("append after unsubscribe");
    }

    #[tokio::test]
    async fn missing_items_are_reported() {
        let store = MemoryStore::new();
        let err = store
            .update_item("call", "offerCandidates", 3, json!(null))
            .expect_err("nothing to update");
        assert!(matches!(err, StoreError::ItemNotFound { index: 3, .. }));
    }
}
