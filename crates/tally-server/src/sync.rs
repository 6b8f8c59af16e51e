//! Streams syncable collections to one socket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use tally_proto::Envelope;

use crate::error::ServerError;
use crate::registry::Connection;

/// One syncable entity collection exposed by the persistent store.
///
/// `find_changed` is optional: collections that cannot answer
/// "changed since" return `Ok(None)` (the default) and the engine falls
/// back to a full fetch.
#[async_trait]
pub trait SyncCollection: Send + Sync {
    /// Collection name, used as the `e` field of streamed `list` frames.
    fn name(&self) -> &str;

    /// Every record in the collection.
    async fn find_many(&self) -> anyhow::Result<Vec<Value>>;

    /// Records whose last-modified timestamp exceeds `since`, or `None`
    /// when the collection does not track modification times.
    async fn find_changed(&self, _since: DateTime<Utc>) -> anyhow::Result<Option<Vec<Value>>> {
        Ok(None)
    }
}

/// Streams each registered collection to one socket on request.
///
/// Per request the stream is `IDLE -> STREAMING -> FINISHED`: one `list`
/// frame per collection in declaration order, then a single
/// `sync finished` frame carrying the new cursor.
pub struct SyncEngine {
    collections: Vec<Arc<dyn SyncCollection>>,
}

impl SyncEngine {
    /// Builds an engine over collections in their fixed sync order.
    pub fn new(collections: Vec<Arc<dyn SyncCollection>>) -> Self {
        Self { collections }
    }

    /// Streams every collection to `conn`.
    ///
    /// `last_sync_at = None` means full sync. The completion cursor is
    /// stamped at completion time, not at start, so records written
    /// mid-sync are picked up by the next cycle rather than skipped.
    ///
    /// A store failure aborts the stream before `sync finished` is sent;
    /// the client's cursor stays put and its next sync retries the whole
    /// cycle, which keeps partial streams idempotent-safe.
    pub async fn sync_data(
        &self,
        conn: &Connection,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<(), ServerError> {
        debug!(
            connection = %conn.id,
            user = %conn.user_id,
            full = last_sync_at.is_none(),
            "sync stream started"
        );

        for collection in &self.collections {
            let records = match last_sync_at {
                None => collection.find_many().await?,
                Some(since) => match collection.find_changed(since).await? {
                    Some(changed) => changed,
                    None => collection.find_many().await?,
                },
            };
            conn.send(Envelope::list(collection.name(), records));
        }

        let cursor = Utc::now();
        conn.send(Envelope::sync_finished(cursor));
        debug!(connection = %conn.id, cursor = %cursor, "sync stream finished");
        Ok(())
    }
}
