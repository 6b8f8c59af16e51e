//! In-memory reference implementation of a syncable collection.
//!
//! The real persistent store lives outside this crate; this implementation
//! backs the tests and the demo server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::sync::SyncCollection;

struct Row {
    value: Value,
    updated_at: DateTime<Utc>,
}

/// A named in-memory collection with per-row last-modified timestamps.
pub struct MemoryCollection {
    name: String,
    track_changes: bool,
    rows: RwLock<Vec<Row>>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            track_changes: true,
            rows: RwLock::new(Vec::new()),
        }
    }

    /// A collection that cannot answer "changed since"; the sync engine
    /// always full-fetches it.
    pub fn without_change_tracking(name: impl Into<String>) -> Self {
        Self {
            track_changes: false,
            ..Self::new(name)
        }
    }

    /// Appends a record stamped with the current time.
    pub async fn insert(&self, value: Value) {
        self.insert_at(value, Utc::now()).await;
    }

    /// Appends a record with an explicit last-modified timestamp.
    pub async fn insert_at(&self, value: Value, updated_at: DateTime<Utc>) {
        self.rows.write().await.push(Row { value, updated_at });
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl SyncCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_many(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .map(|row| row.value.clone())
            .collect())
    }

    async fn find_changed(&self, since: DateTime<Utc>) -> anyhow::Result<Option<Vec<Value>>> {
        if !self.track_changes {
            return Ok(None);
        }
        Ok(Some(
            self.rows
                .read()
                .await
                .iter()
                .filter(|row| row.updated_at > since)
                .map(|row| row.value.clone())
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_find_changed_filters_on_timestamp() {
        let collection = MemoryCollection::new("account");
        let old = Utc::now() - chrono::Duration::minutes(10);
        collection.insert_at(json!({"id": 1}), old).await;
        collection.insert(json!({"id": 2})).await;

        let since = Utc::now() - chrono::Duration::minutes(5);
        let changed = collection.find_changed(since).await.unwrap().unwrap();
        assert_eq!(changed, vec![json!({"id": 2})]);

        let all = collection.find_many().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_untracked_collection_reports_unsupported() {
        let collection = MemoryCollection::without_change_tracking("account");
        collection.insert(json!({"id": 1})).await;

        let changed = collection.find_changed(Utc::now()).await.unwrap();
        assert!(changed.is_none());
    }
}
