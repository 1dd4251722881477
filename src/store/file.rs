//! File-backed store: one JSON document per game under a directory.
//!
//! Survives restarts, which is what lets a client reconnect to a session the
//! current process has never seen.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::game::state::SessionId;
use crate::store::{GameRecord, GameStore, StoreError};

/// `GameStore` writing `<dir>/<game_id>.json`.
#[derive(Debug, Clone)]
pub struct FileGameStore {
    dir: PathBuf,
}

impl FileGameStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, game_id: &SessionId) -> Result<PathBuf, StoreError> {
        let id = game_id.as_str();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl GameStore for FileGameStore {
    async fn upsert(&self, record: &GameRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.game_id)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;

        // Write-then-rename so a crash never leaves a torn record.
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, game_id: &SessionId) -> Result<Option<GameRecord>, StoreError> {
        let path = self.path_for(game_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::record;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chess-arena-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = temp_dir("roundtrip");
        let store = FileGameStore::open(&dir).await.unwrap();

        let mut rec = record("3f1c-aa");
        rec.moves = vec!["e2e4".into(), "e7e5".into()];
        store.upsert(&rec).await.unwrap();

        // A fresh handle on the same directory sees the record.
        let reopened = FileGameStore::open(&dir).await.unwrap();
        let loaded = reopened.load(&rec.game_id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_record() {
        let dir = temp_dir("missing");
        let store = FileGameStore::open(&dir).await.unwrap();
        assert!(store.load(&SessionId::new("absent")).await.unwrap().is_none());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = temp_dir("traversal");
        let store = FileGameStore::open(&dir).await.unwrap();
        let result = store.load(&SessionId::new("../etc/passwd")).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
