use std::fs::{File, OpenOptions};
use std::io::{Write, Read, Seek, SeekFrom};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use crate::core::types::{Row, RowId};
use crate::storage::layout::StorageLayout;
use crate::txn::diff::TableDiff;
use crate::core::error::{Result, Error, ErrorKind};

/// Bytes before each record: payload length, then its crc32.
const HEADER_LEN: u64 = 8;

/// Write-ahead log for durability
#[derive(Debug)]
pub struct WAL {
    pub file: File,
    pub position: u64,
    pub sync_mode: SyncMode,
    pub sequence: u64,
    pub max_entry_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Immediate,  // fsync after every write
    Batch,      // fsync periodically
    None,       // Let OS handle it
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WALEntry {
    pub sequence: u64,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Diffs of one committed transaction, applied together.
    Commit(Vec<TableDiff>),
    Put { table: String, rows: Vec<Row> },
    /// An empty id list clears the table.
    Remove { table: String, ids: Vec<RowId> },
}

impl WAL {
    pub fn open(storage: &StorageLayout, sequence: u64, sync_mode: SyncMode, max_entry_bytes: usize) -> Result<Self> {
        let path = storage.wal_path(sequence);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let position = file.seek(SeekFrom::End(0))?;

        Ok(WAL {
            file,
            position,
            sync_mode,
            sequence,
            max_entry_bytes,
        })
    }

    pub fn append(&mut self, operation: Operation) -> Result<()> {
        let entry = WALEntry {
            sequence: self.sequence,
            operation,
            timestamp: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        if data.len() > self.max_entry_bytes {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("WAL entry of {} bytes exceeds the {} byte limit", data.len(), self.max_entry_bytes),
            ));
        }
        let len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        let mut record = Vec::with_capacity(HEADER_LEN as usize + data.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(&data);
        self.file.write_all(&record)?;

        let before = self.position;
        self.sequence += 1;
        self.position += record.len() as u64;

        match self.sync_mode {
            SyncMode::Immediate => self.file.sync_data()?,
            // Sync whenever a 1MB boundary is crossed
            SyncMode::Batch if before / (1024 * 1024) != self.position / (1024 * 1024) => {
                self.file.sync_data()?
            },
            _ => {}
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Closes this segment and continues in a new file named after the current sequence.
    pub fn rotate(&mut self, storage: &StorageLayout) -> Result<()> {
        self.sync()?;
        let new_wal = WAL::open(storage, self.sequence, self.sync_mode, self.max_entry_bytes)?;
        *self = new_wal;
        Ok(())
    }

    /// Reads every intact record of one segment. Reading stops at the first
    /// truncated or corrupt record; everything after it is ignored.
    pub fn read_segment(storage: &StorageLayout, sequence: u64, max_entry_bytes: usize) -> Result<Vec<WALEntry>> {
        let path = storage.wal_path(sequence);
        let mut file = File::open(&path)?;
        let mut entries = Vec::new();
        let mut offset = 0u64;

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            match file.read_exact(&mut header) {
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::new(ErrorKind::Io, format!("Failed to read WAL: {}", e))),
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len > max_entry_bytes {
                warn!(path = %path.display(), offset, len, "WAL record length out of range, ignoring tail");
                break;
            }

            let mut data = vec![0u8; len];
            if file.read_exact(&mut data).is_err() {
                warn!(path = %path.display(), offset, "truncated WAL record, ignoring tail");
                break;
            }
            if crc32fast::hash(&data) != checksum {
                warn!(path = %path.display(), offset, "WAL checksum mismatch, ignoring tail");
                break;
            }
            match bincode::deserialize::<WALEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "undecodable WAL record, ignoring tail");
                    break;
                }
            }
            offset += HEADER_LEN + len as u64;
        }

        Ok(entries)
    }

    /// Find all WAL files for recovery, oldest first
    pub fn find_wal_files(storage: &StorageLayout) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        let wal_dir = storage.wal_dir();

        if wal_dir.exists() {
            for entry in std::fs::read_dir(wal_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|s| s.to_str()) != Some("log") {
                    continue;
                }
                // Format: wal_00000000.log
                let sequence = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix("wal_"))
                    .and_then(|s| s.parse::<u64>().ok());
                if let Some(seq) = sequence {
                    sequences.push(seq);
                }
            }
        }

        sequences.sort();
        Ok(sequences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use tempfile::TempDir;

    fn put(v: i64) -> Operation {
        Operation::Put {
            table: "t".to_string(),
            rows: vec![row!("v" => v).with_id(v)],
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        let mut wal = WAL::open(&layout, 0, SyncMode::None, 1 << 20).unwrap();
        for v in 0..3 {
            wal.append(put(v)).unwrap();
        }
        wal.sync().unwrap();

        let entries = WAL::read_segment(&layout, 0, 1 << 20).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].sequence, 2);
        assert_eq!(WAL::find_wal_files(&layout).unwrap(), vec![0]);
    }

    #[test]
    fn test_corrupt_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        let mut wal = WAL::open(&layout, 0, SyncMode::Immediate, 1 << 20).unwrap();
        wal.append(put(1)).unwrap();
        wal.append(put(2)).unwrap();
        drop(wal);

        // Flip the last byte of the second record.
        let path = layout.wal_path(0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, bytes).unwrap();

        let entries = WAL::read_segment(&layout, 0, 1 << 20).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        let mut wal = WAL::open(&layout, 0, SyncMode::None, 16).unwrap();
        assert_eq!(wal.append(put(1)).unwrap_err().kind, ErrorKind::InvalidArgument);
        assert_eq!(wal.position, 0);
    }
}
