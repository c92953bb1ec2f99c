use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::{Row, RowId};
use crate::index::index_store::IndexStore;
use crate::index::key::Key;
use crate::index::runtime::RuntimeIndex;
use crate::schema::schema::{Schema, Table};
use crate::storage::cache::Cache;
use crate::txn::diff::TableDiff;

/// Committed in-memory state of one database: rows plus every index over them.
#[derive(Debug)]
pub struct InMemoryState {
    pub schema: Arc<Schema>,
    pub cache: Cache,
    pub indices: IndexStore,
}

impl InMemoryState {
    pub fn new(schema: Arc<Schema>, max_node_size: usize) -> Self {
        let indices = IndexStore::from_schema(&schema, max_node_size);
        InMemoryState {
            schema,
            cache: Cache::new(),
            indices,
        }
    }

    pub fn index(&self, name: &str) -> Result<&dyn RuntimeIndex> {
        self.indices
            .get(name)
            .ok_or_else(|| Error::not_found(format!("index {} does not exist", name)))
    }

    /// Fails if `after` would collide with another row on any unique index.
    /// `after` replacing a row with the same id is not a collision.
    pub fn check_unique(&self, table: &Table, after: &Row) -> Result<()> {
        for def in table.unique_indices() {
            let key = Key::from_row(def, after);
            if def.columns.len() == 1 && key.is_null() {
                continue;
            }
            let name = def.normalized_name();
            let index = self.index(&name)?;
            if index.get(&key).iter().any(|id| *id != after.id) {
                return Err(Error::duplicate_key(&name, key));
            }
        }
        Ok(())
    }

    /// Row ids on `index` whose key equals `key`.
    pub fn lookup(&self, index: &str, key: &Key) -> Result<Vec<RowId>> {
        Ok(self.index(index)?.get(key))
    }

    /// Replaces `before` by `after` in the cache and every index of `table`.
    /// With `checked` unset, unique indices overwrite instead of rejecting.
    pub fn apply_row(&mut self, table: &Table, before: Option<&Row>, after: Option<&Row>, checked: bool) -> Result<()> {
        if let Some(row) = before {
            self.unindex(table, row)?;
            self.cache.remove(&table.name, row.id);
        }
        if let Some(row) = after {
            self.index_row(table, row, checked)?;
            self.cache.set(&table.name, row.clone());
        }
        Ok(())
    }

    fn unindex(&mut self, table: &Table, row: &Row) -> Result<()> {
        self.indices
            .get_mut(&table.row_id_index_name())?
            .remove(&Key::from(row.id), None)?;
        for def in table.all_indices() {
            let key = Key::from_row(def, row);
            self.indices.get_mut(&def.normalized_name())?.remove(&key, Some(row.id))?;
        }
        Ok(())
    }

    fn index_row(&mut self, table: &Table, row: &Row, checked: bool) -> Result<()> {
        self.indices
            .get_mut(&table.row_id_index_name())?
            .set(Key::from(row.id), row.id)?;
        for def in table.all_indices() {
            let key = Key::from_row(def, row);
            let index = self.indices.get_mut(&def.normalized_name())?;
            if def.unique && !checked {
                index.set(key, row.id)?;
            } else {
                index.add(key, row.id)?;
            }
        }
        Ok(())
    }

    /// Applies whole diffs in two phases: every outgoing image is removed
    /// before any incoming image is added, so swapped unique keys never clash.
    pub fn apply_diffs(&mut self, diffs: &[TableDiff], checked: bool) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        for diff in diffs {
            let table = schema.table(diff.name())?;
            for (before, _) in diff.modifications() {
                self.apply_row(table, before.as_ref(), None, checked)?;
            }
        }
        for diff in diffs {
            let table = schema.table(diff.name())?;
            for (_, after) in diff.modifications() {
                self.apply_row(table, None, after.as_ref(), checked)?;
            }
        }
        Ok(())
    }

    /// Loads stored rows of one table; returns the largest row id seen.
    pub fn load_table(&mut self, table: &str, rows: Vec<Row>) -> Result<RowId> {
        let schema = Arc::clone(&self.schema);
        let table = schema.table(table)?;
        let mut max_id = 0;
        for row in rows {
            max_id = max_id.max(row.id);
            self.apply_row(table, None, Some(&row), false)?;
        }
        Ok(max_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::Value;
    use crate::row;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};

    fn state() -> InMemoryState {
        let schema = SchemaBuilder::new("s", 1)
            .table(
                TableBuilder::new("t")
                    .add_column("id", DataType::Integer)
                    .add_nullable_column("email", DataType::String)
                    .add_primary_key(&["id"])
                    .add_unique("uq_email", &["email"]),
            )
            .build()
            .unwrap();
        InMemoryState::new(Arc::new(schema), 4)
    }

    #[test]
    fn test_unique_check_ignores_self_and_nulls() {
        let mut state = state();
        let schema = Arc::clone(&state.schema);
        let table = schema.table("t").unwrap();
        let a = row!("id" => 1, "email" => "a@x").with_id(1);
        let b = row!("id" => 2, "email" => Value::Null).with_id(2);
        state.apply_row(table, None, Some(&a), true).unwrap();
        state.apply_row(table, None, Some(&b), true).unwrap();

        state.check_unique(table, &row!("id" => 1, "email" => "new").with_id(1)).unwrap();
        state.check_unique(table, &row!("id" => 3, "email" => Value::Null).with_id(3)).unwrap();
        let err = state.check_unique(table, &row!("id" => 3, "email" => "a@x").with_id(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
    }

    #[test]
    fn test_unchecked_paths_keep_every_null_key() {
        let mut state = state();
        let rows = vec![
            row!("id" => 1, "email" => Value::Null).with_id(1),
            row!("id" => 2, "email" => Value::Null).with_id(2),
            row!("id" => 3, "email" => "c@x").with_id(3),
        ];
        state.load_table("t", rows.clone()).unwrap();
        let all = |s: &InMemoryState| s.index("t.uq_email").unwrap().get_range(None, false, None, None);
        assert_eq!(all(&state), vec![1, 2, 3]);

        // undoing a delete of row 1 goes through the unchecked path too
        let mut diff = TableDiff::new("t");
        diff.delete(rows[0].clone());
        state.apply_diffs(&[diff.clone()], true).unwrap();
        assert_eq!(all(&state), vec![2, 3]);
        state.apply_diffs(&[diff.reverse()], false).unwrap();
        assert_eq!(all(&state), vec![1, 2, 3]);
        assert_eq!(state.lookup("t.uq_email", &Key::Single(Value::Null)).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_two_phase_swap() {
        let mut state = state();
        let schema = Arc::clone(&state.schema);
        let table = schema.table("t").unwrap();
        let a = row!("id" => 1, "email" => "a").with_id(1);
        let b = row!("id" => 2, "email" => "b").with_id(2);
        state.apply_row(table, None, Some(&a), true).unwrap();
        state.apply_row(table, None, Some(&b), true).unwrap();

        let mut diff = TableDiff::new("t");
        diff.modify(a.clone(), row!("id" => 1, "email" => "b").with_id(1)).unwrap();
        diff.modify(b.clone(), row!("id" => 2, "email" => "a").with_id(2)).unwrap();
        state.apply_diffs(&[diff], true).unwrap();

        let owner = state.lookup("t.uq_email", &Key::from("a")).unwrap();
        assert_eq!(owner, vec![2]);
        assert_eq!(state.cache.get(1).unwrap().get("email"), &Value::from("b"));
    }
}
