use std::path::PathBuf;
use std::fs;
use crate::core::error::Result;

/// Directory structure of a durable log store
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory, holds the lock file
    pub wal_dir: PathBuf,       // Commit log segments
    pub meta_dir: PathBuf,      // Checkpoint snapshots
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let wal_dir = base_dir.join("wal");
        let meta_dir = base_dir.join("meta");

        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&meta_dir)?;

        Ok(StorageLayout {
            base_dir,
            wal_dir,
            meta_dir,
        })
    }

    pub fn wal_path(&self, sequence: u64) -> PathBuf {
        self.wal_dir.join(format!("wal_{:08}.log", sequence))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.meta_dir.join("checkpoint.bin")
    }

    /// Written first, then renamed over the checkpoint.
    pub fn checkpoint_tmp_path(&self) -> PathBuf {
        self.meta_dir.join("checkpoint.bin.tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }

    pub fn wal_dir(&self) -> &PathBuf {
        &self.wal_dir
    }
}
