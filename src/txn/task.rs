use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Map, Value as Json};
use tracing::{debug, error, warn};
use crate::core::error::{Error, Result};
use crate::core::stats::TransactionStats;
use crate::core::types::{Row, RowIdGenerator, Value};
use crate::plan::executor::{execute, read};
use crate::plan::QueryEngine;
use crate::query::builder::Query;
use crate::schema::schema::{DataType, Schema};
use crate::storage::state::InMemoryState;
use crate::storage::store::{BackStore, TransactionType};
use crate::txn::diff::TableDiff;
use crate::txn::journal::{Journal, JournalState};
use crate::txn::runner::{LockGuard, Task, TaskPriority};

/// Services of one open database, handed to every task.
#[derive(Clone)]
pub struct TaskContext {
    pub schema: Arc<Schema>,
    pub state: Arc<RwLock<InMemoryState>>,
    pub store: Arc<dyn BackStore>,
    pub engine: Arc<QueryEngine>,
    pub ids: Arc<RowIdGenerator>,
}

impl TaskContext {
    /// Lock scope of `queries`: tables read, plus every table a write could
    /// reach through foreign keys.
    pub fn scope_of(&self, queries: &[Query]) -> BTreeSet<String> {
        let mut scope = BTreeSet::new();
        for query in queries {
            match query.target_table() {
                Some(target) => scope.extend(self.schema.connected_tables([target])),
                None => scope.extend(query.tables()),
            }
        }
        scope
    }

    pub fn all_tables(&self) -> BTreeSet<String> {
        self.schema.tables.keys().cloned().collect()
    }

    /// Persists `journal`'s committed diffs. A store failure undoes them in
    /// memory as well.
    async fn persist(&self, journal: &mut Journal, scope: &BTreeSet<String>) -> Result<TransactionStats> {
        let diffs = journal.diffs();
        if diffs.is_empty() {
            return Ok(TransactionStats::from_diffs(&diffs));
        }
        let scope: Vec<String> = scope.iter().cloned().collect();
        let committed = match self.store.create_tx(TransactionType::ReadWrite, &scope, diffs) {
            Ok(tx) => tx.commit().await,
            Err(err) => Err(err),
        };
        match committed {
            Ok(stats) => Ok(stats),
            Err(err) => {
                warn!(error = %err, "store commit failed, rolling back");
                Err(abort_with(err, journal, &mut self.state.write()))
            }
        }
    }
}

/// Rolls `journal` back after `cause`. A failed rollback leaves the state
/// half reverted, so it replaces `cause` with an internal error naming both.
fn abort_with(cause: Error, journal: &mut Journal, state: &mut InMemoryState) -> Error {
    match journal.rollback(state) {
        Ok(()) => {
            debug!(error = %cause, "journal rolled back");
            cause
        }
        Err(failure) => {
            error!(error = %cause, rollback = %failure, "rollback failed");
            Error::internal(format!("rollback after [{}] failed: {}", cause, failure))
        }
    }
}

/// Compiles and runs every query against `state`, then checks deferred
/// constraints and seals the journal.
fn run_writes(
    engine: &QueryEngine,
    state: &mut InMemoryState,
    journal: &mut Journal,
    queries: &[Query],
) -> Result<Vec<Vec<Row>>> {
    let mut results = Vec::with_capacity(queries.len());
    for query in queries {
        for table in query.tables() {
            journal.ensure_scope(&table)?;
        }
        let plan = engine.compile(query, state)?;
        results.push(execute(&plan, state, journal)?);
    }
    journal.check_deferred_constraints(state)?;
    journal.commit()?;
    Ok(results)
}

#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub results: Vec<Vec<Row>>,
    pub stats: TransactionStats,
}

/// Runs a list of bound queries as one atomic unit.
pub struct QueryTask {
    ctx: TaskContext,
    queries: Vec<Query>,
    priority: TaskPriority,
}

impl QueryTask {
    pub fn new(ctx: TaskContext, queries: Vec<Query>) -> Self {
        QueryTask {
            ctx,
            queries,
            priority: TaskPriority::UserQuery,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Task for QueryTask {
    type Output = TaskOutcome;

    fn priority(&self) -> TaskPriority {
        self.priority
    }

    fn scope(&self) -> BTreeSet<String> {
        self.ctx.scope_of(&self.queries)
    }

    fn tx_type(&self) -> TransactionType {
        if self.queries.iter().all(Query::is_read_only) {
            TransactionType::ReadOnly
        } else {
            TransactionType::ReadWrite
        }
    }

    async fn exec(self) -> Result<TaskOutcome> {
        if self.tx_type() == TransactionType::ReadOnly {
            let state = self.ctx.state.read();
            let results = self
                .queries
                .iter()
                .map(|q| read(&self.ctx.engine.compile(q, &state)?, &state))
                .collect::<Result<Vec<_>>>()?;
            return Ok(TaskOutcome {
                results,
                stats: TransactionStats::from_diffs(std::iter::empty()),
            });
        }

        let scope = self.scope();
        let mut journal = Journal::new(scope.clone(), Arc::clone(&self.ctx.ids));
        let results = {
            let mut state = self.ctx.state.write();
            match run_writes(&self.ctx.engine, &mut state, &mut journal, &self.queries) {
                Ok(results) => results,
                Err(err) => return Err(abort_with(err, &mut journal, &mut state)),
            }
        };
        let stats = self.ctx.persist(&mut journal, &scope).await?;
        Ok(TaskOutcome { results, stats })
    }
}

/// Write transaction that keeps its locks while queries are attached one
/// at a time, until it commits or rolls back.
pub struct TransactionTask {
    ctx: TaskContext,
    journal: Journal,
    guard: Option<LockGuard>,
    results: Vec<Vec<Row>>,
}

impl TransactionTask {
    pub fn new(ctx: TaskContext, scope: BTreeSet<String>, guard: LockGuard) -> Self {
        let journal = Journal::new(scope, Arc::clone(&ctx.ids));
        TransactionTask {
            ctx,
            journal,
            guard: Some(guard),
            results: Vec::new(),
        }
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        self.journal.scope()
    }

    /// Runs one query inside the transaction. Any failure rolls back every
    /// write made so far.
    pub fn attach(&mut self, query: &Query) -> Result<Vec<Row>> {
        if self.journal.status() != JournalState::Open {
            return Err(Error::invalid_state("transaction already finished"));
        }
        let mut state = self.ctx.state.write();
        let outcome = query
            .tables()
            .iter()
            .try_for_each(|t| self.journal.ensure_scope(t))
            .and_then(|_| {
                let plan = self.ctx.engine.compile(query, &state)?;
                execute(&plan, &mut state, &mut self.journal)
            });
        match outcome {
            Ok(rows) => {
                self.results.push(rows.clone());
                Ok(rows)
            }
            Err(err) => {
                let err = abort_with(err, &mut self.journal, &mut state);
                self.guard.take();
                Err(err)
            }
        }
    }

    pub async fn commit(mut self) -> Result<TaskOutcome> {
        let checked = {
            let mut state = self.ctx.state.write();
            self.journal
                .check_deferred_constraints(&state)
                .and_then(|_| self.journal.commit().map(|_| ()))
                .map_err(|err| abort_with(err, &mut self.journal, &mut state))
        };
        if let Err(err) = checked {
            self.guard.take();
            return Err(err);
        }
        let scope = self.journal.scope().clone();
        let stats = self.ctx.persist(&mut self.journal, &scope).await;
        self.guard.take();
        Ok(TaskOutcome {
            results: std::mem::take(&mut self.results),
            stats: stats?,
        })
    }

    pub fn rollback(mut self) -> Result<()> {
        let result = self.journal.rollback(&mut self.ctx.state.write());
        self.guard.take();
        result
    }
}

impl Drop for TransactionTask {
    fn drop(&mut self) {
        if self.journal.status() == JournalState::Open {
            if let Err(err) = self.journal.rollback(&mut self.ctx.state.write()) {
                error!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}

/// Applies diffs that originated outside this engine. Rows are written to
/// the in-memory state as they are; constraints are not checked.
pub struct ExternalChangeTask {
    ctx: TaskContext,
    diffs: Vec<TableDiff>,
}

impl ExternalChangeTask {
    pub fn new(ctx: TaskContext, diffs: Vec<TableDiff>) -> Self {
        ExternalChangeTask { ctx, diffs }
    }
}

#[async_trait]
impl Task for ExternalChangeTask {
    type Output = TransactionStats;

    fn priority(&self) -> TaskPriority {
        TaskPriority::ExternalChange
    }

    fn scope(&self) -> BTreeSet<String> {
        self.diffs.iter().map(|d| d.name().to_string()).collect()
    }

    fn tx_type(&self) -> TransactionType {
        TransactionType::ReadWrite
    }

    async fn exec(self) -> Result<TransactionStats> {
        self.ctx.state.write().apply_diffs(&self.diffs, false)?;
        let max_id = self
            .diffs
            .iter()
            .flat_map(|d| d.added().keys().chain(d.modified().keys()))
            .copied()
            .max();
        if let Some(max_id) = max_id {
            self.ctx.ids.seed_past(max_id);
        }
        let stats = TransactionStats::from_diffs(&self.diffs);
        debug!(tables = stats.changed_tables, "applied external changes");
        Ok(stats)
    }
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => json!(i),
        Value::Number(n) => json!(n),
        Value::String(s) => Json::String(s.clone()),
        Value::DateTime(d) => Json::String(d.to_rfc3339()),
        Value::Bytes(b) => json!(b),
    }
}

fn from_json(data_type: DataType, json: &Json) -> Result<Value> {
    let mismatch = || Error::invalid_argument(format!("cannot read {} as {:?}", json, data_type));
    if json.is_null() {
        return Ok(Value::Null);
    }
    Ok(match data_type {
        DataType::Boolean => Value::Boolean(json.as_bool().ok_or_else(mismatch)?),
        DataType::Integer => Value::Integer(json.as_i64().ok_or_else(mismatch)?),
        DataType::Number => Value::Number(json.as_f64().ok_or_else(mismatch)?),
        DataType::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
        DataType::DateTime => {
            let text = json.as_str().ok_or_else(mismatch)?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|_| mismatch())?;
            Value::DateTime(parsed.with_timezone(&Utc))
        }
        DataType::Bytes => Value::Bytes(serde_json::from_value(json.clone()).map_err(|_| mismatch())?),
    })
}

/// Dumps every table as `{name, version, tables: {table: [row, ..]}}`.
pub struct ExportTask {
    ctx: TaskContext,
}

impl ExportTask {
    pub fn new(ctx: TaskContext) -> Self {
        ExportTask { ctx }
    }
}

#[async_trait]
impl Task for ExportTask {
    type Output = Json;

    fn priority(&self) -> TaskPriority {
        TaskPriority::Export
    }

    fn scope(&self) -> BTreeSet<String> {
        self.ctx.all_tables()
    }

    fn tx_type(&self) -> TransactionType {
        TransactionType::ReadOnly
    }

    async fn exec(self) -> Result<Json> {
        let state = self.ctx.state.read();
        let mut tables = Map::new();
        for table in self.ctx.schema.tables() {
            let rows: Vec<Json> = state
                .cache
                .table_rows(&table.name)
                .iter()
                .map(|row| {
                    let payload: Map<String, Json> =
                        row.payload.iter().map(|(c, v)| (c.clone(), to_json(v))).collect();
                    Json::Object(payload)
                })
                .collect();
            tables.insert(table.name.clone(), Json::Array(rows));
        }
        Ok(json!({
            "name": self.ctx.schema.name,
            "version": self.ctx.schema.version,
            "tables": tables,
        }))
    }
}

/// Loads an export into a database whose tables are all empty. Foreign keys
/// are checked once every table is loaded.
pub struct ImportTask {
    ctx: TaskContext,
    data: Json,
}

impl ImportTask {
    pub fn new(ctx: TaskContext, data: Json) -> Self {
        ImportTask { ctx, data }
    }

    fn parse(&self) -> Result<BTreeMap<String, Vec<Row>>> {
        let schema = &self.ctx.schema;
        if self.data["name"] != json!(schema.name) || self.data["version"] != json!(schema.version) {
            return Err(Error::invalid_argument(format!(
                "import data is not for database {} version {}",
                schema.name, schema.version
            )));
        }
        let tables = self.data["tables"]
            .as_object()
            .ok_or_else(|| Error::invalid_argument("import data has no tables object"))?;

        let mut out = BTreeMap::new();
        for (name, rows) in tables {
            let table = schema.table(name)?;
            let rows = rows
                .as_array()
                .ok_or_else(|| Error::invalid_argument(format!("rows of {} must be an array", name)))?;
            let parsed = rows
                .iter()
                .map(|json| {
                    let mut row = Row::dummy(BTreeMap::new());
                    for column in &table.columns {
                        let value = from_json(column.data_type, &json[column.name.as_str()])?;
                        row.set(column.name.as_str(), value);
                    }
                    Ok(row)
                })
                .collect::<Result<Vec<_>>>()?;
            out.insert(name.clone(), parsed);
        }
        Ok(out)
    }
}

#[async_trait]
impl Task for ImportTask {
    type Output = TransactionStats;

    fn priority(&self) -> TaskPriority {
        TaskPriority::Import
    }

    fn scope(&self) -> BTreeSet<String> {
        self.ctx.all_tables()
    }

    fn tx_type(&self) -> TransactionType {
        TransactionType::ReadWrite
    }

    async fn exec(self) -> Result<TransactionStats> {
        let tables = self.parse()?;
        let scope = self.scope();
        let mut journal = Journal::new(scope.clone(), Arc::clone(&self.ctx.ids));
        journal.defer_foreign_keys();
        {
            let mut state = self.ctx.state.write();
            if let Some(table) = scope.iter().find(|t| state.cache.count(t) > 0) {
                return Err(Error::invalid_state(format!("cannot import into non-empty table {}", table)));
            }
            let loaded = tables
                .into_iter()
                .try_for_each(|(name, rows)| journal.insert(&mut state, &name, rows).map(|_| ()))
                .and_then(|_| journal.check_deferred_constraints(&state))
                .and_then(|_| journal.commit().map(|_| ()));
            if let Err(err) = loaded {
                return Err(abort_with(err, &mut journal, &mut state));
            }
        }
        self.ctx.persist(&mut journal, &scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::query::builder::{DeleteQuery, InsertQuery, SelectQuery};
    use crate::query::relation::col;
    use crate::row;
    use crate::schema::schema::{ConstraintAction, ConstraintTiming, SchemaBuilder, TableBuilder};
    use crate::index::key::Key;
    use crate::storage::memory::MemoryStore;
    use crate::storage::store::{StoreTable, StoreTx};

    /// Accepts every transaction and fails every commit.
    struct FullDisk;

    struct FullDiskTx;

    #[async_trait]
    impl StoreTx for FullDiskTx {
        fn get_table(&self, name: &str) -> Result<Arc<dyn StoreTable>> {
            Err(Error::not_found(format!("table {}", name)))
        }

        async fn commit(self: Box<Self>) -> Result<TransactionStats> {
            Err(Error::new(ErrorKind::Io, "no space left on device".to_string()))
        }

        fn abort(self: Box<Self>) {}
    }

    #[async_trait]
    impl BackStore for FullDisk {
        async fn init(&self, _schema: &Schema) -> Result<()> {
            Ok(())
        }

        fn create_tx(&self, _: TransactionType, _: &[String], _: Vec<TableDiff>) -> Result<Box<dyn StoreTx>> {
            Ok(Box::new(FullDiskTx))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn context() -> (TaskContext, MemoryStore) {
        let schema = SchemaBuilder::new("hr", 1)
            .table(
                TableBuilder::new("dept")
                    .add_column("id", DataType::Integer)
                    .add_column("name", DataType::String)
                    .add_primary_key(&["id"]),
            )
            .table(
                TableBuilder::new("emp")
                    .add_column("id", DataType::Integer)
                    .add_nullable_column("dept_id", DataType::Integer)
                    .add_primary_key(&["id"])
                    .add_foreign_key(
                        "fk_dept",
                        "dept_id",
                        ("dept", "id"),
                        ConstraintAction::Restrict,
                        ConstraintTiming::Immediate,
                    ),
            )
            .table(TableBuilder::new("log").add_column("msg", DataType::String))
            .build()
            .unwrap();
        let schema = Arc::new(schema);
        let store = MemoryStore::new();
        store.init(&schema).await.unwrap();
        let ctx = TaskContext {
            schema: Arc::clone(&schema),
            state: Arc::new(RwLock::new(InMemoryState::new(schema, 8))),
            store: Arc::new(store.clone()),
            engine: Arc::new(QueryEngine::new()),
            ids: Arc::new(RowIdGenerator::new()),
        };
        (ctx, store)
    }

    fn insert(table: &str, rows: Vec<Row>) -> Query {
        InsertQuery::into_table(table).values(rows).into_query()
    }

    #[tokio::test]
    async fn test_write_scope_follows_foreign_keys() {
        let (ctx, _) = context().await;
        let scope = ctx.scope_of(&[DeleteQuery::from("dept").into_query()]);
        assert_eq!(scope, ["dept", "emp"].iter().map(|s| s.to_string()).collect());
        let scope = ctx.scope_of(&[SelectQuery::new(vec![]).from("log").into_query()]);
        assert_eq!(scope.len(), 1);
    }

    #[tokio::test]
    async fn test_query_task_commits_to_store() {
        let (ctx, store) = context().await;
        let task = QueryTask::new(
            ctx.clone(),
            vec![
                insert("dept", vec![row!("id" => 1, "name" => "eng")]),
                insert("emp", vec![row!("id" => 1, "dept_id" => 1)]),
            ],
        );
        let outcome = task.exec().await.unwrap();
        assert_eq!(outcome.stats.inserted_rows, 2);
        assert_eq!(store.table("emp").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_task() {
        let (ctx, store) = context().await;
        let task = QueryTask::new(
            ctx.clone(),
            vec![
                insert("dept", vec![row!("id" => 1, "name" => "eng")]),
                insert("emp", vec![row!("id" => 1, "dept_id" => 7)]),
            ],
        );
        let err = task.exec().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForeignKeyViolation);
        assert_eq!(ctx.state.read().cache.total_rows(), 0);
        assert!(store.table("dept").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_then_import() {
        let (ctx, _) = context().await;
        QueryTask::new(
            ctx.clone(),
            vec![
                insert("dept", vec![row!("id" => 1, "name" => "eng")]),
                insert("emp", vec![row!("id" => 4, "dept_id" => 1), row!("id" => 5, "dept_id" => Value::Null)]),
            ],
        )
        .exec()
        .await
        .unwrap();
        let dump = ExportTask::new(ctx.clone()).exec().await.unwrap();
        assert_eq!(dump["tables"]["emp"].as_array().unwrap().len(), 2);

        // importing into a populated database is refused
        let err = ImportTask::new(ctx.clone(), dump.clone()).exec().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        let (fresh, _) = context().await;
        let stats = ImportTask::new(fresh.clone(), dump).exec().await.unwrap();
        assert_eq!(stats.inserted_rows, 3);
        let rows = fresh.state.read().cache.table_rows("emp");
        assert!(rows.iter().any(|r| r.get("dept_id") == &Value::Integer(1)));
    }

    #[tokio::test]
    async fn test_external_changes_seed_row_ids() {
        let (ctx, _) = context().await;
        let mut diff = TableDiff::new("log");
        diff.add(row!("msg" => "hello").with_id(40));
        let stats = ExternalChangeTask::new(ctx.clone(), vec![diff]).exec().await.unwrap();
        assert_eq!(stats.inserted_rows, 1);
        assert!(ctx.ids.peek() > 40);

        let select = SelectQuery::new(vec![]).from("log").where_(col("log", "msg").eq("hello"));
        let outcome = QueryTask::new(ctx, vec![select.into_query()]).exec().await.unwrap();
        assert_eq!(outcome.results[0].len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_reverts_rows_and_indices() {
        let (ctx, _) = context().await;
        let ctx = TaskContext {
            store: Arc::new(FullDisk),
            ..ctx
        };
        let err = QueryTask::new(ctx.clone(), vec![insert("dept", vec![row!("id" => 1, "name" => "eng")])])
            .exec()
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);

        let state = ctx.state.read();
        assert_eq!(state.cache.total_rows(), 0);
        assert!(state.lookup("dept.pkdept", &Key::from(1i64)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_reported() {
        let (ctx, _) = context().await;
        let mut state = ctx.state.write();
        let mut journal = Journal::new(ctx.all_tables(), Arc::clone(&ctx.ids));
        journal.rollback(&mut state).unwrap();

        // a second rollback cannot succeed
        let err = abort_with(Error::duplicate_key("dept.pkdept", 1), &mut journal, &mut state);
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.context.contains("duplicate key"), "{}", err);
    }
}
