use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::stats::TransactionStats;
use crate::core::types::{Row, RowId};
use crate::schema::schema::Schema;
use crate::storage::store::{BackStore, StoreTable, StoreTx, TransactionType};
use crate::txn::diff::TableDiff;

#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<BTreeMap<RowId, Row>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        MemoryTable::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Row> {
        self.rows.read().values().cloned().collect()
    }

    pub fn put_rows(&self, rows: impl IntoIterator<Item = Row>) {
        let mut map = self.rows.write();
        for row in rows {
            map.insert(row.id, row);
        }
    }

    pub fn remove_rows(&self, ids: &[RowId]) {
        let mut map = self.rows.write();
        if ids.is_empty() {
            map.clear();
        } else {
            for id in ids {
                map.remove(id);
            }
        }
    }

    pub fn apply(&self, diff: &TableDiff) {
        let mut map = self.rows.write();
        for id in diff.deleted().keys() {
            map.remove(id);
        }
        for row in diff.current_rows() {
            map.insert(row.id, row.clone());
        }
    }
}

#[async_trait]
impl StoreTable for MemoryTable {
    async fn get(&self, ids: &[RowId]) -> Result<Vec<Row>> {
        let map = self.rows.read();
        if ids.is_empty() {
            return Ok(map.values().cloned().collect());
        }
        Ok(ids.iter().filter_map(|id| map.get(id)).cloned().collect())
    }

    async fn put(&self, rows: Vec<Row>) -> Result<()> {
        self.put_rows(rows);
        Ok(())
    }

    async fn remove(&self, ids: &[RowId]) -> Result<()> {
        self.remove_rows(ids);
        Ok(())
    }
}

pub type TableMap = Arc<RwLock<BTreeMap<String, Arc<MemoryTable>>>>;

pub(crate) fn lookup_table(tables: &TableMap, name: &str) -> Result<Arc<MemoryTable>> {
    tables
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("table {} does not exist in the store", name)))
}

/// Volatile store; nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: TableMap,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn table(&self, name: &str) -> Result<Arc<MemoryTable>> {
        lookup_table(&self.tables, name)
    }
}

#[async_trait]
impl BackStore for MemoryStore {
    async fn init(&self, schema: &Schema) -> Result<()> {
        let mut tables = self.tables.write();
        for table in schema.tables() {
            tables.entry(table.name.clone()).or_insert_with(|| Arc::new(MemoryTable::new()));
        }
        Ok(())
    }

    fn create_tx(&self, tx_type: TransactionType, _scope: &[String], diffs: Vec<TableDiff>) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            tables: Arc::clone(&self.tables),
            tx_type,
            diffs,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryTx {
    tables: TableMap,
    tx_type: TransactionType,
    diffs: Vec<TableDiff>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    fn get_table(&self, name: &str) -> Result<Arc<dyn StoreTable>> {
        let table: Arc<dyn StoreTable> = lookup_table(&self.tables, name)?;
        Ok(table)
    }

    async fn commit(self: Box<Self>) -> Result<TransactionStats> {
        if self.tx_type == TransactionType::ReadOnly {
            return Ok(TransactionStats::from_diffs(std::iter::empty()));
        }
        // Resolve every table first so a missing one leaves the store untouched.
        let targets = self
            .diffs
            .iter()
            .map(|d| lookup_table(&self.tables, d.name()))
            .collect::<Result<Vec<_>>>()?;
        for (table, diff) in targets.iter().zip(&self.diffs) {
            table.apply(diff);
        }
        let stats = TransactionStats::from_diffs(&self.diffs);
        debug!(tables = stats.changed_tables, rows = stats.inserted_rows + stats.updated_rows + stats.deleted_rows, "memory store commit");
        Ok(stats)
    }

    fn abort(self: Box<Self>) {}
}
