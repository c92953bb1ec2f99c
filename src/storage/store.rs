use std::sync::Arc;
use async_trait::async_trait;
use crate::core::error::Result;
use crate::core::stats::TransactionStats;
use crate::core::types::{Row, RowId};
use crate::schema::schema::Schema;
use crate::txn::diff::TableDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    ReadOnly,
    ReadWrite,
}

/// Durable rows of one table.
#[async_trait]
pub trait StoreTable: Send + Sync {
    /// Rows with the given ids; every row when `ids` is empty.
    async fn get(&self, ids: &[RowId]) -> Result<Vec<Row>>;

    async fn put(&self, rows: Vec<Row>) -> Result<()>;

    /// Removes the given ids; every row when `ids` is empty.
    async fn remove(&self, ids: &[RowId]) -> Result<()>;
}

/// One storage-level transaction. Committing applies the diffs it was
/// created with, atomically with respect to other store transactions.
#[async_trait]
pub trait StoreTx: Send {
    fn get_table(&self, name: &str) -> Result<Arc<dyn StoreTable>>;

    async fn commit(self: Box<Self>) -> Result<TransactionStats>;

    fn abort(self: Box<Self>);
}

/// Storage collaborator. The engine only talks to durable data through this.
#[async_trait]
pub trait BackStore: Send + Sync {
    async fn init(&self, schema: &Schema) -> Result<()>;

    fn create_tx(&self, tx_type: TransactionType, scope: &[String], diffs: Vec<TableDiff>) -> Result<Box<dyn StoreTx>>;

    /// Flushes and releases any held resources.
    async fn close(&self) -> Result<()>;
}
