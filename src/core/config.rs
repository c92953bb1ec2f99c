use std::path::PathBuf;
use crate::storage::wal::SyncMode;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of the durable log store. Ignored by the in-memory store.
    pub storage_path: PathBuf,

    pub btree_max_node_size: usize,

    pub wal_sync_mode: SyncMode,
    pub max_wal_entry_bytes: usize,
    pub checkpoint_every_commits: u64,
}

impl Config {
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: path.into(),
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            btree_max_node_size: 512,
            wal_sync_mode: SyncMode::Batch,
            max_wal_entry_bytes: 64 * 1024 * 1024, // 64MB per commit record
            checkpoint_every_commits: 1000,
        }
    }
}
