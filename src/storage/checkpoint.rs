use std::collections::BTreeMap;
use std::fs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use crate::core::types::Row;
use crate::storage::layout::StorageLayout;
use crate::storage::wal::{Operation, WAL};
use crate::core::error::Result;

/// Full snapshot of every table. WAL segments numbered below `wal_sequence`
/// are already folded into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub wal_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl Checkpoint {
    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Load checkpoint from disk
    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(path)?;
        let checkpoint = bincode::deserialize(&data)?;
        Ok(Some(checkpoint))
    }

    /// Save checkpoint to disk through a rename, so a crash never leaves half a snapshot
    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let data = bincode::serialize(self)?;
        let tmp = storage.checkpoint_tmp_path();
        fs::write(&tmp, data)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(tmp, storage.checkpoint_path())?;
        Ok(())
    }
}

/// State recovered at open: the last checkpoint plus the operations logged after it.
pub struct Recovered {
    pub checkpoint: Option<Checkpoint>,
    pub operations: Vec<Operation>,
    /// Sequence the next WAL record gets.
    pub next_sequence: u64,
}

pub struct RecoveryManager {
    pub storage: StorageLayout,
    pub max_entry_bytes: usize,
}

impl RecoveryManager {
    pub fn new(storage: StorageLayout, max_entry_bytes: usize) -> Self {
        RecoveryManager {
            storage,
            max_entry_bytes,
        }
    }

    pub fn recover(&self) -> Result<Recovered> {
        let checkpoint = Checkpoint::load(&self.storage)?;
        let start = checkpoint.as_ref().map(|c| c.wal_sequence).unwrap_or(0);
        if let Some(c) = &checkpoint {
            info!(timestamp = %c.timestamp, rows = c.row_count(), "recovering from checkpoint");
        }

        let mut operations = Vec::new();
        let mut next_sequence = start;
        for segment in WAL::find_wal_files(&self.storage)? {
            if segment < start {
                continue;
            }
            for entry in WAL::read_segment(&self.storage, segment, self.max_entry_bytes)? {
                if entry.sequence < next_sequence {
                    warn!(sequence = entry.sequence, "skipping WAL record older than the replay position");
                    continue;
                }
                next_sequence = entry.sequence + 1;
                operations.push(entry.operation);
            }
        }

        info!(operations = operations.len(), next_sequence, "replayed WAL");
        Ok(Recovered {
            checkpoint,
            operations,
            next_sequence,
        })
    }

    /// Removes segments fully covered by a checkpoint at `wal_sequence`.
    pub fn purge_before(&self, wal_sequence: u64) -> Result<()> {
        for segment in WAL::find_wal_files(&self.storage)? {
            if segment < wal_sequence {
                fs::remove_file(self.storage.wal_path(segment))?;
            }
        }
        Ok(())
    }
}
