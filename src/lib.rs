pub mod core;
pub mod schema;
pub mod index;
pub mod storage;
pub mod query;
pub mod plan;
pub mod txn;

pub use crate::core::config::Config;
pub use crate::core::database::Database;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::stats::{DatabaseStats, TransactionStats};
pub use crate::core::transaction::{Transaction, TransactionState};
pub use crate::core::types::{Row, RowId, Value};
pub use crate::schema::schema::{
    ConstraintAction, ConstraintTiming, DataType, Order, Schema, SchemaBuilder, TableBuilder,
};

/*
┌──────────────────────────────────── STRATA LAYOUT ─────────────────────────────────────┐
│                                                                                          │
│  Database ── TaskContext { schema, state: Arc<RwLock<InMemoryState>>, store, engine }    │
│     │                                                                                    │
│     ├── Runner ──── Dispatcher (tokio task, owns Scheduler + LockManager)                │
│     │                 queue ordered by (priority, task id), two-phase table locks        │
│     │                                                                                    │
│     ├── QueryTask / TransactionTask / ExternalChangeTask / ExportTask / ImportTask       │
│     │        │                                                                           │
│     │        ├── QueryEngine::compile                                                   │
│     │        │     generate ─► rewrite rules ─► lower ─► physical rules                  │
│     │        │     (LogicalNode)                 (PhysicalNode, cost::choose_index)      │
│     │        │                                                                           │
│     │        ├── executor::execute ─► Journal (constraints, cascades, diffs)            │
│     │        │                          │                                                │
│     │        │                          ▼                                                │
│     │        │                    InMemoryState { Cache, IndexStore (B-trees) }         │
│     │        │                                                                           │
│     │        └── BackStore::create_tx(..).commit()                                       │
│     │                                                                                    │
│     └── BackStore: MemoryStore | LogStore (WAL + checkpoint + flock)                     │
│                                                                                          │
└──────────────────────────────────────────────────────────────────────────────────────────┘
*/
