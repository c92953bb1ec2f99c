use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::stats::TransactionStats;
use crate::core::types::Row;
use crate::query::builder::Query;
use crate::storage::store::TransactionType;
use crate::txn::runner::{Runner, TaskPriority};
use crate::txn::task::{QueryTask, TaskContext, TransactionTask};

static TRANSACTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    AcquiringScope,
    AcquiredScope,
    ExecutingAttached,
    ExecutingAndCommitting,
    Committing,
    RollingBack,
    Finalized,
}

impl TransactionState {
    fn can_move_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Created, ExecutingAndCommitting)
                | (Created, AcquiringScope)
                | (AcquiringScope, AcquiredScope)
                | (AcquiringScope, Finalized)
                | (AcquiredScope, ExecutingAttached)
                | (AcquiredScope, Committing)
                | (AcquiredScope, RollingBack)
                | (ExecutingAttached, AcquiredScope)
                | (ExecutingAttached, Finalized)
                | (ExecutingAndCommitting, Finalized)
                | (Committing, Finalized)
                | (RollingBack, Finalized)
        )
    }
}

/// A user transaction. Either runs a batch of queries atomically through
/// [`Transaction::exec`], or holds a declared scope between
/// [`Transaction::begin`] and [`Transaction::commit`]/[`Transaction::rollback`].
pub struct Transaction {
    pub id: u64,
    state: TransactionState,
    ctx: TaskContext,
    runner: Arc<Runner>,
    task: Option<TransactionTask>,
    stats: Option<TransactionStats>,
}

impl Transaction {
    pub(crate) fn new(ctx: TaskContext, runner: Arc<Runner>) -> Self {
        Transaction {
            id: TRANSACTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
            state: TransactionState::Created,
            ctx,
            runner,
            task: None,
            stats: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Outcome, once the transaction is finalized.
    pub fn stats(&self) -> Option<&TransactionStats> {
        self.stats.as_ref()
    }

    fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(Error::invalid_state(format!(
                "transaction {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(transaction = self.id, from = ?self.state, to = ?next, "transaction state");
        self.state = next;
        Ok(())
    }

    fn finalize(&mut self, stats: TransactionStats) -> Result<()> {
        self.task = None;
        self.stats = Some(stats);
        self.transition(TransactionState::Finalized)
    }

    /// Runs `queries` as one atomic unit and finalizes the transaction.
    pub async fn exec(&mut self, queries: Vec<Query>) -> Result<Vec<Vec<Row>>> {
        self.transition(TransactionState::ExecutingAndCommitting)?;
        let task = QueryTask::new(self.ctx.clone(), queries).with_priority(TaskPriority::Transaction);
        match self.runner.schedule(task).await {
            Ok(outcome) => {
                self.finalize(outcome.stats)?;
                Ok(outcome.results)
            }
            Err(err) => {
                self.finalize(TransactionStats::failed())?;
                Err(err)
            }
        }
    }

    /// Waits for exclusive use of `scope`. Later attached queries may only
    /// touch these tables.
    pub async fn begin(&mut self, scope: &[&str]) -> Result<()> {
        self.transition(TransactionState::AcquiringScope)?;
        let scope: BTreeSet<String> = scope.iter().map(|t| t.to_string()).collect();
        if let Some(unknown) = scope.iter().find(|t| self.ctx.schema.table(t).is_err()) {
            let err = Error::not_found(format!("table {} does not exist", unknown));
            self.finalize(TransactionStats::failed())?;
            return Err(err);
        }
        let guard = match self
            .runner
            .acquire(TaskPriority::Transaction, scope.clone(), TransactionType::ReadWrite)
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                self.finalize(TransactionStats::failed())?;
                return Err(err);
            }
        };
        self.task = Some(TransactionTask::new(self.ctx.clone(), scope, guard));
        self.transition(TransactionState::AcquiredScope)
    }

    /// Runs one query inside the begun scope. A failing query rolls back the
    /// whole transaction and finalizes it.
    pub fn attach(&mut self, query: impl Into<Query>) -> Result<Vec<Row>> {
        self.transition(TransactionState::ExecutingAttached)?;
        let query = query.into();
        let outcome = match self.task.as_mut() {
            Some(task) => task.attach(&query),
            None => Err(Error::internal("attached transaction has no task")),
        };
        match outcome {
            Ok(rows) => {
                self.transition(TransactionState::AcquiredScope)?;
                Ok(rows)
            }
            Err(err) => {
                self.finalize(TransactionStats::failed())?;
                Err(err)
            }
        }
    }

    pub async fn commit(&mut self) -> Result<TransactionStats> {
        self.transition(TransactionState::Committing)?;
        let task = self
            .task
            .take()
            .ok_or_else(|| Error::internal("committing transaction has no task"))?;
        match task.commit().await {
            Ok(outcome) => {
                self.finalize(outcome.stats.clone())?;
                Ok(outcome.stats)
            }
            Err(err) => {
                self.finalize(TransactionStats::failed())?;
                Err(err)
            }
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.transition(TransactionState::RollingBack)?;
        let result = match self.task.take() {
            Some(task) => task.rollback(),
            None => Err(Error::internal("rolling back transaction has no task")),
        };
        self.finalize(TransactionStats::failed())?;
        result
    }
}
