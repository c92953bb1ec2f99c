use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::RwLock;
use tracing::info;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::{DatabaseStats, TransactionStats};
use crate::core::transaction::Transaction;
use crate::core::types::{Row, RowIdGenerator, Value};
use crate::plan::QueryEngine;
use crate::query::builder::{DeleteQuery, InsertQuery, Query, SelectQuery, UpdateQuery};
use crate::schema::schema::Schema;
use crate::storage::log_store::LogStore;
use crate::storage::memory::MemoryStore;
use crate::storage::state::InMemoryState;
use crate::storage::store::{BackStore, TransactionType};
use crate::txn::diff::TableDiff;
use crate::txn::runner::Runner;
use crate::txn::task::{ExportTask, ExternalChangeTask, ImportTask, QueryTask, TaskContext};

/// One open database. Every query is admitted by the runner, so callers
/// may share a `Database` freely across tasks.
pub struct Database {
    config: Config,
    ctx: TaskContext,
    runner: Arc<Runner>,
    closed: AtomicBool,
}

impl Database {
    /// Initializes `store`, loads every table into memory and builds every
    /// index. Must be called inside a tokio runtime.
    pub async fn open(schema: Schema, store: Arc<dyn BackStore>, config: Config) -> Result<Self> {
        let schema = Arc::new(schema);
        store.init(&schema).await?;

        let mut state = InMemoryState::new(Arc::clone(&schema), config.btree_max_node_size);
        let ids = Arc::new(RowIdGenerator::new());
        let tables: Vec<String> = schema.tables.keys().cloned().collect();
        let tx = store.create_tx(TransactionType::ReadOnly, &tables, Vec::new())?;
        for name in &tables {
            let rows = tx.get_table(name)?.get(&[]).await?;
            let max_id = state.load_table(name, rows)?;
            ids.seed_past(max_id);
        }
        tx.abort();

        info!(
            database = %schema.name,
            version = schema.version,
            tables = tables.len(),
            rows = state.cache.total_rows(),
            "database opened"
        );
        let ctx = TaskContext {
            schema,
            state: Arc::new(RwLock::new(state)),
            store,
            engine: Arc::new(QueryEngine::new()),
            ids,
        };
        Ok(Database {
            config,
            ctx,
            runner: Arc::new(Runner::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn open_in_memory(schema: Schema) -> Result<Self> {
        Self::open(schema, Arc::new(MemoryStore::new()), Config::default()).await
    }

    /// Opens a durable database under `config.storage_path`.
    pub async fn open_durable(schema: Schema, config: Config) -> Result<Self> {
        let store = Arc::new(LogStore::new(config.clone()));
        Self::open(schema, store, config).await
    }

    pub fn schema(&self) -> &Schema {
        &self.ctx.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("database is closed"));
        }
        Ok(())
    }

    /// Runs one query on its own and returns its rows: the selected rows,
    /// or the rows inserted, updated or deleted.
    pub async fn exec(&self, query: impl Into<Query>) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let outcome = self
            .runner
            .schedule(QueryTask::new(self.ctx.clone(), vec![query.into()]))
            .await?;
        Ok(outcome.results.into_iter().next().unwrap_or_default())
    }

    /// Like [`Database::exec`], with placeholders bound to `params`.
    pub async fn exec_with(&self, query: impl Into<Query>, params: &[Value]) -> Result<Vec<Row>> {
        let bound = query.into().bind(params)?;
        self.exec(bound).await
    }

    pub async fn select(&self, query: SelectQuery) -> Result<Vec<Row>> {
        self.exec(query).await
    }

    pub async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.exec(InsertQuery::into_table(table).values(rows)).await
    }

    pub async fn insert_or_replace(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.exec(InsertQuery::into_table(table).or_replace().values(rows)).await
    }

    pub async fn update(&self, query: UpdateQuery) -> Result<Vec<Row>> {
        self.exec(query).await
    }

    pub async fn delete(&self, query: DeleteQuery) -> Result<Vec<Row>> {
        self.exec(query).await
    }

    pub fn create_transaction(&self) -> Result<Transaction> {
        self.ensure_open()?;
        Ok(Transaction::new(self.ctx.clone(), Arc::clone(&self.runner)))
    }

    pub async fn export(&self) -> Result<serde_json::Value> {
        self.ensure_open()?;
        self.runner.schedule(ExportTask::new(self.ctx.clone())).await
    }

    pub async fn import(&self, data: serde_json::Value) -> Result<TransactionStats> {
        self.ensure_open()?;
        self.runner.schedule(ImportTask::new(self.ctx.clone(), data)).await
    }

    /// Applies changes made to the backing store by someone else.
    pub async fn apply_external_changes(&self, diffs: Vec<TableDiff>) -> Result<TransactionStats> {
        self.ensure_open()?;
        self.runner
            .schedule(ExternalChangeTask::new(self.ctx.clone(), diffs))
            .await
    }

    /// The optimized physical plan of `query`, one node per line.
    pub fn explain(&self, query: impl Into<Query>) -> Result<String> {
        let state = self.ctx.state.read();
        let plan = self.ctx.engine.compile(&query.into(), &state)?;
        Ok(plan.explain())
    }

    pub fn stats(&self) -> DatabaseStats {
        let state = self.ctx.state.read();
        DatabaseStats {
            table_count: self.ctx.schema.tables.len(),
            total_rows: state.cache.total_rows() as u64,
            index_count: state.indices.len(),
            pending_tasks: self.runner.pending(),
        }
    }

    /// Flushes and releases the backing store. Later calls fail.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(database = %self.ctx.schema.name, "database closed");
        self.ctx.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::query::relation::col;
    use crate::row;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};

    fn schema() -> Schema {
        SchemaBuilder::new("shop", 1)
            .table(
                TableBuilder::new("item")
                    .add_column("id", DataType::Integer)
                    .add_column("name", DataType::String)
                    .add_column("price", DataType::Number)
                    .add_primary_key(&["id"])
                    .add_unique("uq_name", &["name"]),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_select_update_delete() {
        let db = Database::open_in_memory(schema()).await.unwrap();
        let inserted = db
            .insert(
                "item",
                vec![
                    row!("id" => 1, "name" => "pen", "price" => 1.5),
                    row!("id" => 2, "name" => "ink", "price" => 4.0),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2);
        assert!(inserted.iter().all(|r| r.id > 0));

        let updated = db
            .update(UpdateQuery::table("item").set("price", 2.0).where_(col("item", "id").eq(1)))
            .await
            .unwrap();
        assert_eq!(updated[0].get("price"), &Value::Number(2.0));

        let deleted = db
            .delete(DeleteQuery::from("item").where_(col("item", "name").eq("ink")))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);

        let rows = db.select(SelectQuery::new(vec![]).from("item")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), &Value::from("pen"));
        assert_eq!(db.stats().total_rows, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_leaves_table_untouched() {
        let db = Database::open_in_memory(schema()).await.unwrap();
        db.insert("item", vec![row!("id" => 1, "name" => "pen", "price" => 1.0)])
            .await
            .unwrap();
        let err = db
            .insert(
                "item",
                vec![
                    row!("id" => 2, "name" => "cap", "price" => 1.0),
                    row!("id" => 1, "name" => "nib", "price" => 1.0),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
        assert_eq!(db.stats().total_rows, 1);
    }

    #[tokio::test]
    async fn test_exec_with_params_and_explain() {
        let db = Database::open_in_memory(schema()).await.unwrap();
        db.insert("item", vec![row!("id" => 7, "name" => "pen", "price" => 1.0)])
            .await
            .unwrap();
        let query = SelectQuery::new(vec![]).from("item").where_(col("item", "id").eq(crate::query::param(0)));
        let rows = db.exec_with(query.clone(), &[Value::Integer(7)]).await.unwrap();
        assert_eq!(rows.len(), 1);

        let err = db.exec(query).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let plan = db
            .explain(SelectQuery::new(vec![]).from("item").where_(col("item", "id").eq(7)))
            .unwrap();
        assert!(plan.contains("index_range_scan(item.pkitem"), "{}", plan);
    }

    #[tokio::test]
    async fn test_closed_database_rejects_work() {
        let db = Database::open_in_memory(schema()).await.unwrap();
        db.close().await.unwrap();
        let err = db.select(SelectQuery::new(vec![]).from("item")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }
}
