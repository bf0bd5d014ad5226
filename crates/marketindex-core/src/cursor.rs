//! Source cursors — the last successfully processed read position per
//! polled source.
//!
//! A cursor stores the *next* position a fetch should start from. It is
//! advanced only after the corresponding batch has been fully applied, and
//! it never moves backwards: the source side is at-least-once, the applier
//! is idempotent, so resuming early is always safe and resuming late never
//! happens.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MarketError;

/// A persisted read position for one logical source (chain + kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// Source identifier, e.g. `"indexer-1"` or `"indexer-solana"`.
    pub source_id: String,
    /// Next position to fetch (block height or slot watermark).
    pub position: u64,
    /// Unix timestamp of the last save.
    pub updated_at: i64,
}

impl Cursor {
    pub fn new(source_id: impl Into<String>, position: u64) -> Self {
        Self {
            source_id: source_id.into(),
            position,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Trait for storing and loading cursors.
///
/// Implementations must keep `position` monotonic: a save that would move a
/// cursor backwards is ignored.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, MarketError>;

    /// Save (upsert) a cursor. Regressions are dropped, not persisted.
    async fn save(&self, cursor: Cursor) -> Result<(), MarketError>;

    /// Delete a cursor (e.g. when resetting a source).
    async fn delete(&self, source_id: &str) -> Result<(), MarketError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory cursor store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCursorStore {
    data: Mutex<HashMap<String, Cursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source_id: &str) -> Result<Option<Cursor>, MarketError> {
        Ok(self.data.lock().unwrap().get(source_id).cloned())
    }

    async fn save(&self, cursor: Cursor) -> Result<(), MarketError> {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.get(&cursor.source_id) {
            if existing.position > cursor.position {
                tracing::debug!(
                    source = %cursor.source_id,
                    have = existing.position,
                    got = cursor.position,
                    "ignoring cursor regression"
                );
                return Ok(());
            }
        }
        data.insert(cursor.source_id.clone(), cursor);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), MarketError> {
        self.data.lock().unwrap().remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let store = MemoryCursorStore::new();
        assert!(store.load("indexer-1").await.unwrap().is_none());

        store.save(Cursor::new("indexer-1", 1000)).await.unwrap();
        let cur = store.load("indexer-1").await.unwrap().unwrap();
        assert_eq!(cur.position, 1000);

        store.delete("indexer-1").await.unwrap();
        assert!(store.load("indexer-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn position_is_monotonic() {
        let store = MemoryCursorStore::new();
        store.save(Cursor::new("indexer-1", 500)).await.unwrap();
        store.save(Cursor::new("indexer-1", 400)).await.unwrap(); // regression dropped
        assert_eq!(store.load("indexer-1").await.unwrap().unwrap().position, 500);

        store.save(Cursor::new("indexer-1", 501)).await.unwrap();
        assert_eq!(store.load("indexer-1").await.unwrap().unwrap().position, 501);
    }

    #[tokio::test]
    async fn sources_are_isolated() {
        let store = MemoryCursorStore::new();
        store.save(Cursor::new("indexer-1", 10)).await.unwrap();
        store.save(Cursor::new("indexer-solana", 99)).await.unwrap();
        assert_eq!(store.load("indexer-1").await.unwrap().unwrap().position, 10);
        assert_eq!(
            store.load("indexer-solana").await.unwrap().unwrap().position,
            99
        );
    }
}
