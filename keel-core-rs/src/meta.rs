//! Persisted server metadata.
//!
//! Stores the small amount of state that must survive restarts outside the
//! log: the highest term seen, the vote cast within it, and the index of the
//! last committed configuration. Written atomically (temp file, rename,
//! fsync) on every change.

use crate::error::StorageError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const META_FILE: &str = "meta.json";

/// State persisted per server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMeta {
    /// Highest term this server has seen
    pub current_term: u64,
    /// Candidate voted for in `current_term`, if any
    pub voted_for: Option<NodeId>,
    /// Index of the last committed configuration entry
    pub last_config_index: u64,
}

/// Metadata file handle with a cached copy of the last written state
pub struct MetaStore {
    path: PathBuf,
    cached: ServerMeta,
}

impl MetaStore {
    /// Open the store, reading existing metadata if present
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(META_FILE);

        let cached = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str(&data)?
        } else {
            ServerMeta::default()
        };

        Ok(Self { path, cached })
    }

    pub fn load(&self) -> &ServerMeta {
        &self.cached
    }

    /// Persist new metadata; no-op when nothing changed
    pub fn save(&mut self, meta: ServerMeta) -> Result<(), StorageError> {
        if meta == self.cached {
            return Ok(());
        }

        let temp = self.path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(&meta)?;
        let mut file = File::create(&temp)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, &self.path)?;

        debug!(
            "Meta: Saved term={} voted_for={:?} config_index={}",
            meta.current_term, meta.voted_for, meta.last_config_index
        );
        self.cached = meta;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_meta_round_trip() {
        let dir = tempdir().unwrap();

        {
            let mut store = MetaStore::open(dir.path()).unwrap();
            assert_eq!(store.load(), &ServerMeta::default());

            store
                .save(ServerMeta {
                    current_term: 7,
                    voted_for: Some("n2".to_string()),
                    last_config_index: 3,
                })
                .unwrap();
        }

        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.load().current_term, 7);
        assert_eq!(store.load().voted_for, Some("n2".to_string()));
        assert_eq!(store.load().last_config_index, 3);
    }

    #[test]
    fn test_save_skips_unchanged() {
        let dir = tempdir().unwrap();
        let mut store = MetaStore::open(dir.path()).unwrap();

        let meta = ServerMeta {
            current_term: 1,
            voted_for: None,
            last_config_index: 0,
        };
        store.save(meta.clone()).unwrap();

        let modified_before = fs::metadata(dir.path().join(META_FILE))
            .unwrap()
            .modified()
            .unwrap();
        store.save(meta).unwrap();
        let modified_after = fs::metadata(dir.path().join(META_FILE))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified_before, modified_after);
    }
}
