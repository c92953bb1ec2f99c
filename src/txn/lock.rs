use std::collections::{BTreeSet, HashMap};

pub type TaskId = u64;

/// Lock levels per scope item. Tasks first reserve (`Reserved*`) and later
/// upgrade to the lock they run under (`Shared` for readers, `Exclusive`
/// for writers).
///
/// | Requested          | Granted when                                                  |
/// |--------------------|---------------------------------------------------------------|
/// | ReservedReadOnly   | no task holds ReservedReadWrite                               |
/// | ReservedReadWrite  | no other task holds ReservedReadWrite                         |
/// | Shared             | requester holds ReservedReadOnly, no task holds Exclusive     |
/// | Exclusive          | requester holds ReservedReadWrite, nothing else is held      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    ReservedReadOnly,
    ReservedReadWrite,
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    reserved_rw: Option<TaskId>,
    reserved_ro: BTreeSet<TaskId>,
    shared: BTreeSet<TaskId>,
    exclusive: Option<TaskId>,
}

impl LockEntry {
    fn allows(&self, task: TaskId, lock: LockType) -> bool {
        match lock {
            LockType::ReservedReadOnly => self.reserved_rw.is_none(),
            LockType::ReservedReadWrite => self.reserved_rw.is_none_or(|holder| holder == task),
            LockType::Shared => self.exclusive.is_none() && self.reserved_ro.contains(&task),
            LockType::Exclusive => {
                self.reserved_rw == Some(task)
                    && self.shared.is_empty()
                    && self.reserved_ro.is_empty()
                    && self.exclusive.is_none()
            }
        }
    }

    fn grant(&mut self, task: TaskId, lock: LockType) {
        match lock {
            LockType::ReservedReadOnly => {
                self.reserved_ro.insert(task);
            }
            LockType::ReservedReadWrite => self.reserved_rw = Some(task),
            LockType::Shared => {
                self.reserved_ro.remove(&task);
                self.shared.insert(task);
            }
            LockType::Exclusive => {
                self.reserved_rw = None;
                self.exclusive = Some(task);
            }
        }
    }

    fn release(&mut self, task: TaskId) {
        if self.reserved_rw == Some(task) {
            self.reserved_rw = None;
        }
        if self.exclusive == Some(task) {
            self.exclusive = None;
        }
        self.reserved_ro.remove(&task);
        self.shared.remove(&task);
    }

    fn is_free(&self) -> bool {
        self.reserved_rw.is_none() && self.exclusive.is_none() && self.reserved_ro.is_empty() && self.shared.is_empty()
    }
}

/// Per-table lock table. Requests cover a whole scope and are granted for
/// every item or for none.
#[derive(Debug, Default)]
pub struct LockManager {
    entries: HashMap<String, LockEntry>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    pub fn can_acquire(&self, task: TaskId, scope: &BTreeSet<String>, lock: LockType) -> bool {
        scope.iter().all(|item| match self.entries.get(item) {
            Some(entry) => entry.allows(task, lock),
            None => LockEntry::default().allows(task, lock),
        })
    }

    pub fn request_lock(&mut self, task: TaskId, scope: &BTreeSet<String>, lock: LockType) -> bool {
        if !self.can_acquire(task, scope, lock) {
            return false;
        }
        for item in scope {
            if let Some(entry) = self.entries.get_mut(item) {
                entry.grant(task, lock);
            } else {
                self.entries.entry(item.clone()).or_default().grant(task, lock);
            }
        }
        true
    }

    /// Drops every lock `task` holds on `scope`.
    pub fn release_lock(&mut self, task: TaskId, scope: &BTreeSet<String>) {
        for item in scope {
            let Some(entry) = self.entries.get_mut(item) else {
                continue;
            };
            entry.release(task);
            if entry.is_free() {
                self.entries.remove(item);
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_readers_share() {
        let mut m = LockManager::new();
        let s = scope(&["a"]);
        assert!(m.request_lock(1, &s, LockType::ReservedReadOnly));
        assert!(m.request_lock(2, &s, LockType::ReservedReadOnly));
        assert!(m.request_lock(1, &s, LockType::Shared));
        assert!(m.request_lock(2, &s, LockType::Shared));
    }

    #[test]
    fn test_shared_requires_reservation() {
        let mut m = LockManager::new();
        assert!(!m.request_lock(1, &scope(&["a"]), LockType::Shared));
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let mut m = LockManager::new();
        let s = scope(&["a"]);
        assert!(m.request_lock(1, &s, LockType::ReservedReadOnly));
        assert!(m.request_lock(2, &s, LockType::ReservedReadWrite));
        // new readers cannot reserve behind a writer
        assert!(!m.request_lock(3, &s, LockType::ReservedReadOnly));
        // the writer cannot upgrade while a reader holds a reservation
        assert!(!m.request_lock(2, &s, LockType::Exclusive));
        // the reader already reserved may still run
        assert!(m.request_lock(1, &s, LockType::Shared));
        assert!(!m.request_lock(2, &s, LockType::Exclusive));
        m.release_lock(1, &s);
        assert!(m.request_lock(2, &s, LockType::Exclusive));
        // reservations open up once the writer is exclusive
        assert!(m.request_lock(3, &s, LockType::ReservedReadOnly));
        assert!(!m.request_lock(3, &s, LockType::Shared));
        m.release_lock(2, &s);
        assert!(m.request_lock(3, &s, LockType::Shared));
        m.release_lock(3, &s);
        assert!(m.is_idle());
    }

    #[test]
    fn test_all_or_nothing() {
        let mut m = LockManager::new();
        assert!(m.request_lock(1, &scope(&["b"]), LockType::ReservedReadWrite));
        assert!(!m.request_lock(2, &scope(&["a", "b"]), LockType::ReservedReadWrite));
        // nothing was granted on "a"
        assert!(m.request_lock(3, &scope(&["a"]), LockType::ReservedReadWrite));
    }
}
