use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::{
    ChangeKind, CollectionChange, CollectionItem, CollectionWatch, Document, DocumentWatch,
    SharedStore, StoreError, StoreResult, Watch,
};

/// Redis-backed store.
///
/// Documents are hashes whose fields hold JSON values, collections are lists of JSON
/// values. Every write publishes on a per-key channel; document watchers reload the
/// hash on notification, collection watchers receive the change itself.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str, ttl_seconds: u64) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.to_string(),
            ttl_seconds,
        })
    }

    fn document_key(&self, doc_id: &str) -> String {
        format!("{}:doc:{}", self.prefix, doc_id)
    }

    fn document_channel(&self, doc_id: &str) -> String {
        format!("{}:doc:{}:changed", self.prefix, doc_id)
    }

    fn collection_key(&self, doc_id: &str, collection: &str) -> String {
        format!("{}:doc:{}:col:{}", self.prefix, doc_id, collection)
    }

    fn collection_channel(&self, doc_id: &str, collection: &str) -> String {
        format!("{}:changes", self.collection_key(doc_id, collection))
    }

    async fn subscribe_channel(&self, channel: &str) -> StoreResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel).await.map_err(backend)?;
        Ok(pubsub)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        let mut conn = self.conn.clone();
        read_document(&mut conn, &self.document_key(doc_id)).await
    }

    async fn set(&self, doc_id: &str, fields: Document) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let key = self.document_key(doc_id);
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(&key);
        for (field, value) in &fields {
            pipe.arg(field).arg(serde_json::to_string(value)?);
        }
        pipe.ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .cmd("PUBLISH")
            .arg(self.document_channel(doc_id))
            .arg("set")
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
        trace!(target = "pier.store", %key, fields = fields.len(), "document written");
        Ok(())
    }

    async fn subscribe(&self, doc_id: &str) -> StoreResult<DocumentWatch> {
        let key = self.document_key(doc_id);
        // Subscribe before reading so no write between the two is missed.
        let pubsub = self.subscribe_channel(&self.document_channel(doc_id)).await?;
        let mut conn = self.conn.clone();
        let initial = read_document(&mut conn, &key).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(initial).map_err(|_| StoreError::Closed)?;
        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while messages.next().await.is_some() {
                match read_document(&mut conn, &key).await {
                    Ok(document) => {
                        if tx.send(document).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target = "pier.store", %key, error = %err, "document reload failed");
                    }
                }
            }
        });
        Ok(Watch::with_pump(rx, pump))
    }

    async fn append_to_collection(
        &self,
        doc_id: &str,
        collection: &str,
        item: Value,
    ) -> StoreResult<u64> {
        let key = self.collection_key(doc_id, collection);
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .rpush(&key, serde_json::to_string(&item)?)
            .await
            .map_err(backend)?;
        let index = len.saturating_sub(1);
        let change = CollectionChange {
            kind: ChangeKind::Added,
            item: CollectionItem { index, value: item },
        };
        redis::pipe()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .cmd("PUBLISH")
            .arg(self.collection_channel(doc_id, collection))
            .arg(serde_json::to_string(&change)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(index)
    }

    async fn list_collection(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> StoreResult<Vec<CollectionItem>> {
        let mut conn = self.conn.clone();
        read_range(&mut conn, &self.collection_key(doc_id, collection), 0, -1).await
    }

    async fn subscribe_collection(
        &self,
        doc_id: &str,
        collection: &str,
    ) -> StoreResult<CollectionWatch> {
        let key = self.collection_key(doc_id, collection);
        let pubsub = self
            .subscribe_channel(&self.collection_channel(doc_id, collection))
            .await?;
        let mut conn = self.conn.clone();
        let existing = read_range(&mut conn, &key, 0, -1).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut next_index = existing.len() as u64;
        for item in existing {
            tx.send(CollectionChange {
                kind: ChangeKind::Added,
                item,
            })
            .map_err(|_| StoreError::Closed)?;
        }

        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let change = match message
                    .get_payload::<String>()
                    .map_err(backend)
                    .and_then(|payload| Ok(serde_json::from_str::<CollectionChange>(&payload)?))
                {
                    Ok(change) => change,
                    Err(err) => {
                        warn!(target = "pier.store", %key, error = %err, "undecodable collection change");
                        continue;
                    }
                };

                if change.kind == ChangeKind::Added {
                    let index = change.item.index;
                    if index < next_index {
                        trace!(target = "pier.store", %key, index, "skipping item already delivered");
                        continue;
                    }
                    if index > next_index {
                        // Fill the gap from the list itself so delivery stays in order.
                        match read_range(&mut conn, &key, next_index as isize, index as isize - 1).await {
                            Ok(missing) => {
                                for item in missing {
                                    let filler = CollectionChange {
                                        kind: ChangeKind::Added,
                                        item,
                                    };
                                    if tx.send(filler).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(target = "pier.store", %key, error = %err, "collection gap reload failed");
                            }
                        }
                    }
                    next_index = index + 1;
                }

                if tx.send(change).is_err() {
                    break;
                }
            }
        });
        Ok(Watch::with_pump(rx, pump))
    }
}

async fn read_document(conn: &mut ConnectionManager, key: &str) -> StoreResult<Option<Document>> {
    let raw: HashMap<String, String> = conn.hgetall(key).await.map_err(backend)?;
    if raw.is_empty() {
        return Ok(None);
    }
    let mut document = Document::new();
    for (field, json) in raw {
        document.insert(field, serde_json::from_str(&json)?);
    }
    Ok(Some(document))
}

async fn read_range(
    conn: &mut ConnectionManager,
    key: &str,
    start: isize,
    stop: isize,
) -> StoreResult<Vec<CollectionItem>> {
    let raw: Vec<String> = conn.lrange(key, start, stop).await.map_err(backend)?;
    let offset = start.max(0) as u64;
    raw.into_iter()
        .enumerate()
        .map(|(position, json)| {
            Ok(CollectionItem {
                index: offset + position as u64,
                value: serde_json::from_str(&json)?,
            })
        })
        .collect()
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    //! Needs a live Redis. Run with:
    //! `REDIS_URL=redis://127.0.0.1:6379 cargo test -p signal-store --features redis -- --ignored`

    use super::*;
    use serde_json::json;

    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for this test");
        let prefix = format!("signal-store-test:{}", std::process::id());
        RedisStore::connect(&url, &prefix, 60)
            .await
            .expect("connect to redis")
    }

    #[ignore]
    #[tokio::test]
    async fn redis_collection_watch_orders_and_dedupes() {
        let store = store().await;
        store
            .append_to_collection("call", "offerCandidates", json!("c0"))
            .await
            .expect("append");
        let mut watch = store
            .subscribe_collection("call", "offerCandidates")
            .await
            .expect("subscribe");
        for value in ["c1", "c2"] {
            store
                .append_to_collection("call", "offerCandidates", json!(value))
                .await
                .expect("append");
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let change = tokio::time::timeout(std::time::Duration::from_secs(5), watch.next())
                .await
                .expect("change in time")
                .expect("watch open");
            seen.push((change.item.index, change.item.value));
        }
        assert_eq!(
            seen,
            vec![(0, json!("c0")), (1, json!("c1")), (2, json!("c2"))]
        );
    }

    #[ignore]
    #[tokio::test]
    async fn redis_document_merge_notifies_watchers() {
        let store = store().await;
        let mut watch = store.subscribe("call").await.expect("subscribe");
        assert_eq!(watch.next().await, Some(None));

        let fields = json!({ "offer": { "type": "offer", "sdp": "v=0" } });
        store
            .set("call", fields.as_object().cloned().expect("object"))
            .await
            .expect("set");
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(5), watch.next())
            .await
            .expect("delivery in time")
            .flatten()
            .expect("document");
        assert_eq!(delivered.get("offer"), fields.get("offer"));
    }
}
