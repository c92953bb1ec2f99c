use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::TransactionStats;
use crate::core::types::{Row, RowId};
use crate::schema::schema::Schema;
use crate::storage::checkpoint::{Checkpoint, RecoveryManager};
use crate::storage::file_lock::FileLock;
use crate::storage::layout::StorageLayout;
use crate::storage::memory::{lookup_table, MemoryTable, TableMap};
use crate::storage::store::{BackStore, StoreTable, StoreTx, TransactionType};
use crate::storage::wal::{Operation, SyncMode, WAL};
use crate::txn::diff::TableDiff;

struct LogInner {
    config: Config,
    tables: TableMap,
    layout: Mutex<Option<StorageLayout>>,
    wal: Mutex<Option<WAL>>,
    file_lock: Mutex<Option<FileLock>>,
    commits_since_checkpoint: AtomicU64,
}

/// Durable store: rows are served from memory, every change is appended to a
/// checksummed WAL, and a snapshot checkpoint is taken every
/// `checkpoint_every_commits` commits.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<LogInner>,
}

impl LogStore {
    pub fn new(config: Config) -> Self {
        LogStore {
            inner: Arc::new(LogInner {
                config,
                tables: Arc::new(RwLock::new(BTreeMap::new())),
                layout: Mutex::new(None),
                wal: Mutex::new(None),
                file_lock: Mutex::new(None),
                commits_since_checkpoint: AtomicU64::new(0),
            }),
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.inner.config.wal_sync_mode
    }

    /// Forces a snapshot now.
    pub async fn checkpoint(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.checkpoint()).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("storage worker failed: {}", e)))?
}

impl LogInner {
    fn open(&self, schema: &Schema) -> Result<()> {
        let layout = StorageLayout::new(self.config.storage_path.clone())?;
        let lock = FileLock::acquire(&layout)?;

        {
            let mut tables = self.tables.write();
            for table in schema.tables() {
                tables.entry(table.name.clone()).or_insert_with(|| Arc::new(MemoryTable::new()));
            }
        }

        let recovered = RecoveryManager::new(layout.clone(), self.config.max_wal_entry_bytes).recover()?;
        if let Some(checkpoint) = recovered.checkpoint {
            for (name, rows) in checkpoint.tables {
                match lookup_table(&self.tables, &name) {
                    Ok(table) => table.put_rows(rows),
                    Err(_) => warn!(table = %name, "checkpoint holds a table missing from the schema"),
                }
            }
        }
        let replayed = recovered.operations.len();
        for op in &recovered.operations {
            self.apply(op);
        }

        let wal = WAL::open(
            &layout,
            recovered.next_sequence,
            self.config.wal_sync_mode,
            self.config.max_wal_entry_bytes,
        )?;
        info!(path = %layout.base_dir.display(), replayed, "log store opened");

        *self.wal.lock() = Some(wal);
        *self.layout.lock() = Some(layout);
        *self.file_lock.lock() = Some(lock);
        Ok(())
    }

    fn apply(&self, op: &Operation) {
        match op {
            Operation::Commit(diffs) => {
                for diff in diffs {
                    match lookup_table(&self.tables, diff.name()) {
                        Ok(table) => table.apply(diff),
                        Err(_) => warn!(table = diff.name(), "logged commit names an unknown table"),
                    }
                }
            }
            Operation::Put { table, rows } => match lookup_table(&self.tables, table) {
                Ok(t) => t.put_rows(rows.iter().cloned()),
                Err(_) => warn!(table = %table, "logged put names an unknown table"),
            },
            Operation::Remove { table, ids } => match lookup_table(&self.tables, table) {
                Ok(t) => t.remove_rows(ids),
                Err(_) => warn!(table = %table, "logged remove names an unknown table"),
            },
        }
    }

    /// Logs `op`, then makes it visible.
    fn log_and_apply(&self, op: Operation) -> Result<()> {
        {
            let mut wal = self.wal.lock();
            let wal = wal
                .as_mut()
                .ok_or_else(|| Error::invalid_state("log store is not initialized"))?;
            wal.append(op.clone())?;
        }
        self.apply(&op);
        Ok(())
    }

    fn commit(&self, diffs: Vec<TableDiff>) -> Result<TransactionStats> {
        for diff in &diffs {
            lookup_table(&self.tables, diff.name())?;
        }
        let stats = TransactionStats::from_diffs(&diffs);
        if stats.changed_tables == 0 {
            return Ok(stats);
        }
        self.log_and_apply(Operation::Commit(diffs))?;
        debug!(tables = stats.changed_tables, "log store commit");

        let commits = self.commits_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if commits >= self.config.checkpoint_every_commits {
            self.checkpoint()?;
        }
        Ok(stats)
    }

    fn checkpoint(&self) -> Result<()> {
        let layout = self
            .layout
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("log store is not initialized"))?;
        let mut wal = self.wal.lock();
        let wal = wal
            .as_mut()
            .ok_or_else(|| Error::invalid_state("log store is not initialized"))?;

        let tables = self
            .tables
            .read()
            .iter()
            .map(|(name, table)| (name.clone(), table.snapshot()))
            .collect();
        let checkpoint = Checkpoint {
            wal_sequence: wal.sequence,
            timestamp: Utc::now(),
            tables,
        };
        checkpoint.save(&layout)?;
        wal.rotate(&layout)?;
        RecoveryManager::new(layout, self.config.max_wal_entry_bytes).purge_before(checkpoint.wal_sequence)?;
        self.commits_since_checkpoint.store(0, Ordering::SeqCst);
        info!(wal_sequence = checkpoint.wal_sequence, rows = checkpoint.row_count(), "checkpoint written");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.sync()?;
        }
        *self.wal.lock() = None;
        *self.file_lock.lock() = None;
        Ok(())
    }
}

#[async_trait]
impl BackStore for LogStore {
    async fn init(&self, schema: &Schema) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let schema = schema.clone();
        run_blocking(move || inner.open(&schema)).await
    }

    fn create_tx(&self, tx_type: TransactionType, _scope: &[String], diffs: Vec<TableDiff>) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(LogTx {
            inner: Arc::clone(&self.inner),
            tx_type,
            diffs,
        }))
    }

    async fn close(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.close()).await
    }
}

struct LogTx {
    inner: Arc<LogInner>,
    tx_type: TransactionType,
    diffs: Vec<TableDiff>,
}

#[async_trait]
impl StoreTx for LogTx {
    fn get_table(&self, name: &str) -> Result<Arc<dyn StoreTable>> {
        lookup_table(&self.inner.tables, name)?;
        Ok(Arc::new(LogTable {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn commit(self: Box<Self>) -> Result<TransactionStats> {
        if self.tx_type == TransactionType::ReadOnly {
            return Ok(TransactionStats::from_diffs(std::iter::empty()));
        }
        let LogTx { inner, diffs, .. } = *self;
        run_blocking(move || inner.commit(diffs)).await
    }

    fn abort(self: Box<Self>) {}
}

/// Table view whose writes go through the log.
struct LogTable {
    name: String,
    inner: Arc<LogInner>,
}

#[async_trait]
impl StoreTable for LogTable {
    async fn get(&self, ids: &[RowId]) -> Result<Vec<Row>> {
        lookup_table(&self.inner.tables, &self.name)?.get(ids).await
    }

    async fn put(&self, rows: Vec<Row>) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let table = self.name.clone();
        run_blocking(move || inner.log_and_apply(Operation::Put { table, rows })).await
    }

    async fn remove(&self, ids: &[RowId]) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let table = self.name.clone();
        let ids = ids.to_vec();
        run_blocking(move || inner.log_and_apply(Operation::Remove { table, ids })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::row;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};
    use tempfile::TempDir;

    fn schema() -> Schema {
        SchemaBuilder::new("s", 1)
            .table(TableBuilder::new("t").add_column("v", DataType::Integer))
            .build()
            .unwrap()
    }

    fn config(dir: &TempDir, every: u64) -> Config {
        Config {
            checkpoint_every_commits: every,
            wal_sync_mode: SyncMode::Immediate,
            ..Config::with_storage_path(dir.path())
        }
    }

    async fn commit_rows(store: &LogStore, ids: std::ops::Range<i64>) {
        let mut diff = TableDiff::new("t");
        for id in ids {
            diff.add(row!("v" => id).with_id(id));
        }
        let tx = store.create_tx(TransactionType::ReadWrite, &[], vec![diff]).unwrap();
        tx.commit().await.unwrap();
    }

    async fn read_all(store: &LogStore) -> Vec<Row> {
        let tx = store.create_tx(TransactionType::ReadOnly, &[], Vec::new()).unwrap();
        tx.get_table("t").unwrap().get(&[]).await.unwrap()
    }

    #[tokio::test]
    async fn test_reopen_replays_wal() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(config(&dir, 100));
        store.init(&schema()).await.unwrap();
        commit_rows(&store, 1..4).await;
        store.close().await.unwrap();

        let reopened = LogStore::new(config(&dir, 100));
        reopened.init(&schema()).await.unwrap();
        assert_eq!(read_all(&reopened).await.len(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_then_more_commits() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(config(&dir, 2));
        store.init(&schema()).await.unwrap();
        commit_rows(&store, 1..3).await;
        commit_rows(&store, 3..5).await;
        commit_rows(&store, 5..6).await;
        let tx = store.create_tx(TransactionType::ReadWrite, &[], Vec::new()).unwrap();
        tx.get_table("t").unwrap().remove(&[1]).await.unwrap();
        store.close().await.unwrap();

        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        assert!(Checkpoint::load(&layout).unwrap().is_some());

        let reopened = LogStore::new(config(&dir, 2));
        reopened.init(&schema()).await.unwrap();
        let ids: Vec<RowId> = read_all(&reopened).await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let first = LogStore::new(config(&dir, 10));
        first.init(&schema()).await.unwrap();
        let second = LogStore::new(config(&dir, 10));
        let err = second.init(&schema()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
    }
}
