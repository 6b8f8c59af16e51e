//! Sync cursor persistence seam.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Stores the timestamp of the last fully synchronized moment.
///
/// The manager advances the cursor only when a sync cycle completes
/// (`sync finished` received), never speculatively; a disconnect mid-sync
/// leaves the stored value untouched.
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Option<DateTime<Utc>>;
    fn save(&self, cursor: DateTime<Utc>);
}

/// Process-lifetime cursor storage, the default. Real applications plug
/// in durable storage so a restart does not force a full sync.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<DateTime<Utc>>>,
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Option<DateTime<Utc>> {
        *self.cursor.lock().unwrap()
    }

    fn save(&self, cursor: DateTime<Utc>) {
        *self.cursor.lock().unwrap() = Some(cursor);
    }
}
