use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::{Row, RowIdGenerator};
use crate::index::key::Key;
use crate::schema::schema::{ConstraintAction, ConstraintTiming, Schema};
use crate::storage::state::InMemoryState;
use crate::txn::constraint::{check_orphans, check_reference, check_row_shape, children_of};
use crate::txn::diff::TableDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    Open,
    Committed,
    RolledBack,
}

/// Records the writes of one transaction against the shared in-memory state
/// and enforces constraints as they happen. Each write is applied to the
/// state right away; `rollback` undoes them from the recorded diffs.
#[derive(Debug)]
pub struct Journal {
    scope: BTreeSet<String>,
    diffs: BTreeMap<String, TableDiff>,
    ids: Arc<RowIdGenerator>,
    /// Every foreign key is checked at commit, regardless of its timing.
    defer_all: bool,
    status: JournalState,
}

impl Journal {
    pub fn new(scope: BTreeSet<String>, ids: Arc<RowIdGenerator>) -> Self {
        Journal {
            scope,
            diffs: BTreeMap::new(),
            ids,
            defer_all: false,
            status: JournalState::Open,
        }
    }

    pub fn defer_foreign_keys(&mut self) {
        self.defer_all = true;
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn status(&self) -> JournalState {
        self.status
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status {
            JournalState::Open => Ok(()),
            other => Err(Error::invalid_state(format!("journal already {:?}", other))),
        }
    }

    pub fn ensure_scope(&self, table: &str) -> Result<()> {
        if self.scope.contains(table) {
            Ok(())
        } else {
            Err(Error::out_of_scope(table))
        }
    }

    fn diff_mut(&mut self, table: &str) -> &mut TableDiff {
        self.diffs
            .entry(table.to_string())
            .or_insert_with(|| TableDiff::new(table))
    }

    fn is_immediate(&self, timing: ConstraintTiming) -> bool {
        !self.defer_all && timing == ConstraintTiming::Immediate
    }

    /// Inserts `rows` under fresh row ids and returns them as stored.
    pub fn insert(&mut self, state: &mut InMemoryState, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.ensure_scope(table)?;
        let schema = Arc::clone(&state.schema);
        let def = schema.table(table)?;

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let row = Row::new(self.ids.next_id(), row.payload);
            check_row_shape(def, &row)?;
            state.check_unique(def, &row)?;
            state.apply_row(def, None, Some(&row), true)?;
            self.diff_mut(table).add(row.clone());
            for fk in def.foreign_keys.iter().filter(|fk| self.is_immediate(fk.timing)) {
                check_reference(state, fk, &row)?;
            }
            stored.push(row);
        }
        Ok(stored)
    }

    /// Inserts rows, replacing those whose primary key already exists.
    pub fn insert_or_replace(&mut self, state: &mut InMemoryState, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let schema = Arc::clone(&state.schema);
        let pk = schema
            .table(table)?
            .primary_key
            .as_ref()
            .ok_or_else(|| Error::invalid_argument(format!("insert or replace into {} needs a primary key", table)))?;
        let pk_name = pk.normalized_name();

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let existing = state.lookup(&pk_name, &Key::from_row(pk, &row))?;
            match existing.first() {
                Some(id) => {
                    let replacement = Row::new(*id, row.payload);
                    self.update(state, table, vec![replacement.clone()])?;
                    stored.push(replacement);
                }
                None => stored.extend(self.insert(state, table, vec![row])?),
            }
        }
        Ok(stored)
    }

    /// Replaces stored rows by `rows`, matched on row id. Cascading foreign
    /// keys carry a changed parent value over to the children.
    pub fn update(&mut self, state: &mut InMemoryState, table: &str, rows: Vec<Row>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_scope(table)?;
        let schema = Arc::clone(&state.schema);
        let def = schema.table(table)?;
        let referencing = schema.referencing_keys(table);

        for after in rows {
            let before = state
                .cache
                .get(after.id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("row {} of {} does not exist", after.id, table)))?;
            check_row_shape(def, &after)?;
            state.check_unique(def, &after)?;

            for fk in &referencing {
                let old = before.get(&fk.parent_column);
                if fk.action == ConstraintAction::Restrict
                    && self.is_immediate(fk.timing)
                    && old != after.get(&fk.parent_column)
                    && !children_of(state, fk, old)?.is_empty()
                {
                    return Err(Error::foreign_key(
                        &fk.normalized_name(),
                        format!("{}.{} = {} is still referenced", table, fk.parent_column, old),
                    ));
                }
            }

            state.apply_row(def, Some(&before), Some(&after), true)?;
            self.diff_mut(table).modify(before.clone(), after.clone())?;

            for fk in def.foreign_keys.iter().filter(|fk| self.is_immediate(fk.timing)) {
                if before.get(&fk.child_column) != after.get(&fk.child_column) {
                    check_reference(state, fk, &after)?;
                }
            }

            for fk in referencing.iter().filter(|fk| fk.action == ConstraintAction::Cascade) {
                let old = before.get(&fk.parent_column);
                let new = after.get(&fk.parent_column);
                if old == new {
                    continue;
                }
                let children = state.cache.get_many(&children_of(state, fk, old)?);
                if children.is_empty() {
                    continue;
                }
                self.ensure_scope(&fk.child_table)?;
                let updated = children
                    .into_iter()
                    .map(|mut child| {
                        child.set(fk.child_column.as_str(), new.clone());
                        child
                    })
                    .collect();
                debug!(fk = %fk.normalized_name(), "cascading update");
                self.update(state, &fk.child_table, updated)?;
            }
        }
        Ok(())
    }

    /// Deletes `rows` and every row reached through cascading foreign keys.
    pub fn remove(&mut self, state: &mut InMemoryState, table: &str, rows: Vec<Row>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_scope(table)?;
        let schema = Arc::clone(&state.schema);

        let (doomed, ids) = self.cascade_closure(state, &schema, table, rows)?;
        for (name, row) in &doomed {
            for fk in schema.referencing_keys(name) {
                if fk.action != ConstraintAction::Restrict || !self.is_immediate(fk.timing) {
                    continue;
                }
                let blocking = children_of(state, fk, row.get(&fk.parent_column))?
                    .into_iter()
                    .any(|id| !ids.contains(&id));
                if blocking {
                    return Err(Error::foreign_key(
                        &fk.normalized_name(),
                        format!(
                            "{}.{} = {} is still referenced",
                            name,
                            fk.parent_column,
                            row.get(&fk.parent_column)
                        ),
                    ));
                }
            }
        }

        // Children were discovered after their parents; delete them first.
        for (name, row) in doomed.into_iter().rev() {
            let def = schema.table(&name)?;
            state.apply_row(def, Some(&row), None, true)?;
            self.diff_mut(&name).delete(row);
        }
        Ok(())
    }

    fn cascade_closure(
        &self,
        state: &InMemoryState,
        schema: &Schema,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<(Vec<(String, Row)>, BTreeSet<i64>)> {
        let mut queue: VecDeque<(String, Row)> = rows.into_iter().map(|r| (table.to_string(), r)).collect();
        let mut seen = BTreeSet::new();
        let mut doomed = Vec::new();

        while let Some((name, row)) = queue.pop_front() {
            if !seen.insert(row.id) {
                continue;
            }
            for fk in schema.referencing_keys(&name) {
                if fk.action != ConstraintAction::Cascade {
                    continue;
                }
                let children = children_of(state, fk, row.get(&fk.parent_column))?;
                if children.is_empty() {
                    continue;
                }
                self.ensure_scope(&fk.child_table)?;
                queue.extend(
                    state
                        .cache
                        .get_many(&children)
                        .into_iter()
                        .map(|child| (fk.child_table.clone(), child)),
                );
            }
            doomed.push((name, row));
        }
        Ok((doomed, seen))
    }

    /// Foreign keys checked once all writes are in: every reference written
    /// must resolve, and no parent value that went away may be referenced.
    pub fn check_deferred_constraints(&self, state: &InMemoryState) -> Result<()> {
        self.ensure_open()?;
        let schema = &state.schema;
        for diff in self.diffs.values() {
            let def = schema.table(diff.name())?;
            let referencing = schema.referencing_keys(diff.name());
            for (before, after) in diff.modifications() {
                if let Some(after) = &after {
                    for fk in &def.foreign_keys {
                        check_reference(state, fk, after)?;
                    }
                }
                if let Some(before) = &before {
                    for fk in &referencing {
                        check_orphans(state, fk, before.get(&fk.parent_column))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Non-empty diffs recorded so far.
    pub fn diffs(&self) -> Vec<TableDiff> {
        self.diffs.values().filter(|d| !d.is_empty()).cloned().collect()
    }

    pub fn commit(&mut self) -> Result<Vec<TableDiff>> {
        self.ensure_open()?;
        self.status = JournalState::Committed;
        Ok(self.diffs())
    }

    /// Undoes every recorded write. Also valid after `commit` when the store
    /// failed to persist the diffs.
    pub fn rollback(&mut self, state: &mut InMemoryState) -> Result<()> {
        if self.status == JournalState::RolledBack {
            return Err(Error::invalid_state("journal already rolled back"));
        }
        let reversed: Vec<TableDiff> = self.diffs.values().map(TableDiff::reverse).collect();
        state.apply_diffs(&reversed, false)?;
        self.diffs.clear();
        self.status = JournalState::RolledBack;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::Value;
    use crate::row;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};

    fn state(action: ConstraintAction, timing: ConstraintTiming) -> InMemoryState {
        let schema = SchemaBuilder::new("s", 1)
            .table(
                TableBuilder::new("dept")
                    .add_column("id", DataType::Integer)
                    .add_column("name", DataType::String)
                    .add_primary_key(&["id"]),
            )
            .table(
                TableBuilder::new("emp")
                    .add_column("id", DataType::Integer)
                    .add_column("dept_id", DataType::Integer)
                    .add_primary_key(&["id"])
                    .add_foreign_key("fk_dept", "dept_id", ("dept", "id"), action, timing),
            )
            .build()
            .unwrap();
        InMemoryState::new(Arc::new(schema), 8)
    }

    fn journal() -> Journal {
        let scope = BTreeSet::from(["dept".to_string(), "emp".to_string()]);
        Journal::new(scope, Arc::new(RowIdGenerator::new()))
    }

    fn seed(state: &mut InMemoryState, j: &mut Journal) {
        j.insert(
            state,
            "dept",
            vec![row!("id" => 1, "name" => "a"), row!("id" => 2, "name" => "b")],
        )
        .unwrap();
        j.insert(
            state,
            "emp",
            vec![row!("id" => 10, "dept_id" => 1), row!("id" => 11, "dept_id" => 1)],
        )
        .unwrap();
    }

    #[test]
    fn test_insert_assigns_ids_and_checks_unique() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Immediate);
        let mut j = journal();
        let stored = j.insert(&mut s, "dept", vec![row!("id" => 1, "name" => "a")]).unwrap();
        assert_eq!(stored[0].id, 1);

        let err = j.insert(&mut s, "dept", vec![row!("id" => 1, "name" => "dup")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
        assert_eq!(s.cache.count("dept"), 1);
    }

    #[test]
    fn test_immediate_child_check() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Immediate);
        let mut j = journal();
        let err = j.insert(&mut s, "emp", vec![row!("id" => 1, "dept_id" => 7)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForeignKeyViolation);
    }

    #[test]
    fn test_restrict_delete() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Immediate);
        let mut j = journal();
        seed(&mut s, &mut j);
        let dept1 = s.cache.table_rows("dept").remove(0);
        let err = j.remove(&mut s, "dept", vec![dept1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForeignKeyViolation);
        assert_eq!(s.cache.count("dept"), 2);

        let dept2 = s.cache.table_rows("dept").remove(1);
        j.remove(&mut s, "dept", vec![dept2]).unwrap();
        assert_eq!(s.cache.count("dept"), 1);
    }

    #[test]
    fn test_cascade_delete_and_update() {
        let mut s = state(ConstraintAction::Cascade, ConstraintTiming::Immediate);
        let mut j = journal();
        seed(&mut s, &mut j);

        let mut dept1 = s.cache.table_rows("dept").remove(0);
        dept1.set("id", 5);
        j.update(&mut s, "dept", vec![dept1.clone()]).unwrap();
        assert!(s.cache.table_rows("emp").iter().all(|r| r.get("dept_id") == &Value::Integer(5)));

        j.remove(&mut s, "dept", vec![dept1]).unwrap();
        assert_eq!(s.cache.count("emp"), 0);
        assert_eq!(s.cache.count("dept"), 1);
    }

    #[test]
    fn test_deferred_checked_at_commit() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Deferrable);
        let mut j = journal();
        j.insert(&mut s, "emp", vec![row!("id" => 1, "dept_id" => 3)]).unwrap();
        assert_eq!(
            j.check_deferred_constraints(&s).unwrap_err().kind,
            ErrorKind::ForeignKeyViolation
        );
        j.insert(&mut s, "dept", vec![row!("id" => 3, "name" => "late")]).unwrap();
        j.check_deferred_constraints(&s).unwrap();
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Immediate);
        let mut j = journal();
        seed(&mut s, &mut j);
        j.rollback(&mut s).unwrap();
        assert_eq!(s.cache.total_rows(), 0);
        assert_eq!(s.lookup("dept.pkdept", &Key::from(1i64)).unwrap(), Vec::<i64>::new());
        assert_eq!(j.status(), JournalState::RolledBack);
        assert_eq!(
            j.insert(&mut s, "dept", vec![]).unwrap_err().kind,
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_scope_enforced() {
        let mut s = state(ConstraintAction::Restrict, ConstraintTiming::Immediate);
        let mut j = Journal::new(BTreeSet::from(["dept".to_string()]), Arc::new(RowIdGenerator::new()));
        let err = j.insert(&mut s, "emp", vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ScopeViolation);
    }
}
