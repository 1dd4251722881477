//! In-memory store. Lost on restart; used by default and in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::game::state::SessionId;
use crate::store::{GameRecord, GameStore, StoreError};

/// `GameStore` backed by a map.
#[derive(Default)]
pub struct MemoryGameStore {
    records: RwLock<BTreeMap<SessionId, GameRecord>>,
}

impl MemoryGameStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl GameStore for MemoryGameStore {
    async fn upsert(&self, record: &GameRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.game_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, game_id: &SessionId) -> Result<Option<GameRecord>, StoreError> {
        Ok(self.records.read().await.get(game_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::record;

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = MemoryGameStore::new();
        store.upsert(&record("g1")).await.unwrap();

        let mut updated = record("g1");
        updated.moves.push("e2e4".into());
        store.upsert(&updated).await.unwrap();

        assert_eq!(store.len().await, 1);
        let loaded = store.load(&SessionId::new("g1")).await.unwrap().unwrap();
        assert_eq!(loaded.moves, vec!["e2e4".to_string()]);
    }

    #[tokio::test]
    async fn test_load_missing() {
        let store = MemoryGameStore::new();
        assert!(store.load(&SessionId::new("nope")).await.unwrap().is_none());
    }
}
