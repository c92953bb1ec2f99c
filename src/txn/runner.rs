use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use crate::core::error::{Error, Result};
use crate::storage::store::TransactionType;
use crate::txn::lock::{LockManager, LockType, TaskId};

/// Admission class of a task. Lower values are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    Export,
    Import,
    Observer,
    ExternalChange,
    UserQuery,
    Transaction,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        match self {
            TaskPriority::Export | TaskPriority::Import | TaskPriority::Observer => 0,
            TaskPriority::ExternalChange => 1,
            TaskPriority::UserQuery | TaskPriority::Transaction => 2,
        }
    }
}

#[derive(Debug)]
struct Pending {
    scope: BTreeSet<String>,
    tx_type: TransactionType,
    reserved: bool,
}

impl Pending {
    fn reserve_lock(&self) -> LockType {
        match self.tx_type {
            TransactionType::ReadOnly => LockType::ReservedReadOnly,
            TransactionType::ReadWrite => LockType::ReservedReadWrite,
        }
    }

    fn run_lock(&self) -> LockType {
        match self.tx_type {
            TransactionType::ReadOnly => LockType::Shared,
            TransactionType::ReadWrite => LockType::Exclusive,
        }
    }
}

/// Two-phase admission over a queue ordered by (priority, task id).
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(u8, TaskId), Pending>,
    running: HashMap<TaskId, BTreeSet<String>>,
    locks: LockManager,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler::default()
    }

    pub fn submit(&mut self, id: TaskId, priority: TaskPriority, scope: BTreeSet<String>, tx_type: TransactionType) {
        self.queue.insert(
            (priority.value(), id),
            Pending {
                scope,
                tx_type,
                reserved: false,
            },
        );
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Scans the whole queue from the head and admits every task whose scope
    /// can be locked. Returns the admitted ids in admission order.
    pub fn coordinate(&mut self) -> Vec<TaskId> {
        let mut admitted = Vec::new();
        let keys: Vec<(u8, TaskId)> = self.queue.keys().copied().collect();
        for key in keys {
            let id = key.1;
            let Some(task) = self.queue.get_mut(&key) else {
                continue;
            };
            if !task.reserved {
                task.reserved = self.locks.request_lock(id, &task.scope, task.reserve_lock());
                if !task.reserved {
                    continue;
                }
            }
            if !self.locks.request_lock(id, &task.scope, task.run_lock()) {
                continue;
            }
            if let Some(task) = self.queue.remove(&key) {
                self.running.insert(id, task.scope);
                admitted.push(id);
            }
        }
        admitted
    }

    /// Drops every lock of a finished task, or of a queued one that was
    /// abandoned before admission.
    pub fn release(&mut self, id: TaskId) {
        if let Some(scope) = self.running.remove(&id) {
            self.locks.release_lock(id, &scope);
            return;
        }
        let key = self.queue.keys().find(|(_, queued)| *queued == id).copied();
        if let Some(task) = key.and_then(|k| self.queue.remove(&k)) {
            self.locks.release_lock(id, &task.scope);
        }
    }
}

enum RunnerMessage {
    Schedule {
        id: TaskId,
        priority: TaskPriority,
        scope: BTreeSet<String>,
        tx_type: TransactionType,
        grant_tx: oneshot::Sender<LockGuard>,
    },
    Release(TaskId),
}

/// Held by an admitted task. Dropping it releases the task's locks.
#[derive(Debug)]
pub struct LockGuard {
    id: TaskId,
    released: bool,
    tx_to_dispatcher: mpsc::UnboundedSender<RunnerMessage>,
}

impl LockGuard {
    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

impl std::fmt::Debug for RunnerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerMessage::Schedule { id, priority, .. } => write!(f, "Schedule({}, {:?})", id, priority),
            RunnerMessage::Release(id) => write!(f, "Release({})", id),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.tx_to_dispatcher.send(RunnerMessage::Release(self.id)).is_err() {
            warn!(task = self.id, "runner closed before lock release");
        }
    }
}

/// Single owner of the scheduler. Every admission decision happens here.
struct Dispatcher {
    scheduler: Scheduler,
    waiting: HashMap<TaskId, oneshot::Sender<LockGuard>>,
    tx: mpsc::WeakUnboundedSender<RunnerMessage>,
    rx: mpsc::UnboundedReceiver<RunnerMessage>,
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.handle_message(message);
        }
        debug!("runner dispatcher stopped");
    }

    fn handle_message(&mut self, message: RunnerMessage) {
        match message {
            RunnerMessage::Schedule {
                id,
                priority,
                scope,
                tx_type,
                grant_tx,
            } => {
                trace!(task = id, ?priority, ?tx_type, "task queued");
                self.scheduler.submit(id, priority, scope, tx_type);
                self.waiting.insert(id, grant_tx);
            }
            RunnerMessage::Release(id) => {
                trace!(task = id, "task finished");
                self.scheduler.release(id);
            }
        }
        self.grant_waiting();
    }

    fn grant_waiting(&mut self) {
        loop {
            let mut abandoned = false;
            for id in self.scheduler.coordinate() {
                let (Some(grant_tx), Some(tx_to_dispatcher)) = (self.waiting.remove(&id), self.tx.upgrade()) else {
                    self.scheduler.release(id);
                    abandoned = true;
                    continue;
                };
                let guard = LockGuard {
                    id,
                    released: false,
                    tx_to_dispatcher,
                };
                if let Err(mut guard) = grant_tx.send(guard) {
                    // the requester went away; its locks are freed right here
                    guard.released = true;
                    self.scheduler.release(id);
                    abandoned = true;
                } else {
                    trace!(task = id, "task admitted");
                }
            }
            if !abandoned {
                break;
            }
        }
        self.pending.store(self.scheduler.pending(), Ordering::Relaxed);
    }
}

/// A unit of work admitted by the runner.
#[async_trait]
pub trait Task: Send + Sized {
    type Output: Send;

    fn priority(&self) -> TaskPriority;

    fn scope(&self) -> BTreeSet<String>;

    fn tx_type(&self) -> TransactionType;

    /// Runs with the task's locks held.
    async fn exec(self) -> Result<Self::Output>;
}

/// Handle to the admission loop of one database.
#[derive(Debug)]
pub struct Runner {
    tx: mpsc::UnboundedSender<RunnerMessage>,
    next_id: AtomicU64,
    pending: Arc<AtomicUsize>,
}

impl Runner {
    /// Spawns the dispatcher on the current tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher {
            scheduler: Scheduler::new(),
            waiting: HashMap::new(),
            tx: tx.downgrade(),
            rx,
            pending: Arc::clone(&pending),
        };
        tokio::spawn(dispatcher.run());
        Runner {
            tx,
            next_id: AtomicU64::new(1),
            pending,
        }
    }

    /// Tasks queued but not yet admitted.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Waits until `scope` is locked for `tx_type`.
    pub async fn acquire(&self, priority: TaskPriority, scope: BTreeSet<String>, tx_type: TransactionType) -> Result<LockGuard> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (grant_tx, grant_rx) = oneshot::channel();
        self.tx
            .send(RunnerMessage::Schedule {
                id,
                priority,
                scope,
                tx_type,
                grant_tx,
            })
            .map_err(|_| Error::invalid_state("runner is closed"))?;
        grant_rx
            .await
            .map_err(|_| Error::invalid_state("runner dropped the task before admission"))
    }

    /// Admits `task`, runs it and releases its locks whatever the outcome.
    pub async fn schedule<T: Task>(&self, task: T) -> Result<T::Output> {
        let guard = self.acquire(task.priority(), task.scope(), task.tx_type()).await?;
        let id = guard.task_id();
        let result = task.exec().await;
        if let Err(err) = &result {
            debug!(task = id, error = %err, "task failed");
        }
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn scope(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_priority_then_id_order() {
        let mut s = Scheduler::new();
        s.submit(1, TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadWrite);
        s.submit(2, TaskPriority::Observer, scope(&["a"]), TransactionType::ReadWrite);
        s.submit(3, TaskPriority::ExternalChange, scope(&["a"]), TransactionType::ReadWrite);
        assert_eq!(s.coordinate(), vec![2]);
        s.release(2);
        assert_eq!(s.coordinate(), vec![3]);
        s.release(3);
        assert_eq!(s.coordinate(), vec![1]);
    }

    #[test]
    fn test_disjoint_scopes_run_together() {
        let mut s = Scheduler::new();
        s.submit(1, TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadWrite);
        s.submit(2, TaskPriority::UserQuery, scope(&["b"]), TransactionType::ReadWrite);
        s.submit(3, TaskPriority::UserQuery, scope(&["a", "b"]), TransactionType::ReadOnly);
        assert_eq!(s.coordinate(), vec![1, 2]);
        assert_eq!(s.running(), 2);
        s.release(1);
        assert!(s.coordinate().is_empty());
        s.release(2);
        assert_eq!(s.coordinate(), vec![3]);
    }

    #[test]
    fn test_writer_queued_behind_readers() {
        let mut s = Scheduler::new();
        s.submit(1, TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadOnly);
        assert_eq!(s.coordinate(), vec![1]);
        s.submit(2, TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadWrite);
        s.submit(3, TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadOnly);
        // the writer has reserved the table, so the late reader waits
        assert!(s.coordinate().is_empty());
        s.release(1);
        assert_eq!(s.coordinate(), vec![2]);
        s.release(2);
        assert_eq!(s.coordinate(), vec![3]);
        assert_eq!(s.pending(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_writer_waits_for_guard() {
        let runner = Runner::new();
        let first = runner
            .acquire(TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadWrite)
            .await
            .unwrap();

        let second = runner.acquire(TaskPriority::UserQuery, scope(&["a"]), TransactionType::ReadWrite);
        tokio::pin!(second);
        assert!(timeout(Duration::from_millis(50), &mut second).await.is_err());

        drop(first);
        let second = timeout(Duration::from_millis(500), second)
            .await
            .expect("second writer admitted after release")
            .unwrap();
        assert!(second.task_id() > 1);
    }

    #[tokio::test]
    async fn test_readers_share() {
        let runner = Runner::new();
        let a = runner
            .acquire(TaskPriority::UserQuery, scope(&["t"]), TransactionType::ReadOnly)
            .await
            .unwrap();
        let b = timeout(
            Duration::from_millis(500),
            runner.acquire(TaskPriority::UserQuery, scope(&["t"]), TransactionType::ReadOnly),
        )
        .await
        .expect("readers do not block each other")
        .unwrap();
        assert_ne!(a.task_id(), b.task_id());
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl Task for Count {
        type Output = usize;

        fn priority(&self) -> TaskPriority {
            TaskPriority::UserQuery
        }

        fn scope(&self) -> BTreeSet<String> {
            scope(&["t"])
        }

        fn tx_type(&self) -> TransactionType {
            TransactionType::ReadWrite
        }

        async fn exec(self) -> Result<usize> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_schedule_releases_after_exec() {
        let runner = Runner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let results = futures::future::join_all((0..5).map(|_| runner.schedule(Count(Arc::clone(&counter))))).await;
        let mut seen: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(runner.pending(), 0);
    }
}
