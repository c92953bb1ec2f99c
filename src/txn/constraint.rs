use crate::core::error::{Error, Result};
use crate::core::types::{Row, RowId, Value};
use crate::index::key::Key;
use crate::schema::schema::{DataType, ForeignKeySpec, Schema, Table};
use crate::storage::state::InMemoryState;

fn type_matches(data_type: DataType, value: &Value) -> bool {
    matches!(
        (data_type, value),
        (_, Value::Null)
            | (DataType::Boolean, Value::Boolean(_))
            | (DataType::Integer, Value::Integer(_))
            | (DataType::Number, Value::Number(_) | Value::Integer(_))
            | (DataType::String, Value::String(_))
            | (DataType::DateTime, Value::DateTime(_))
            | (DataType::Bytes, Value::Bytes(_))
    )
}

/// Rejects unknown columns, values of the wrong type and nulls in
/// non-nullable columns. Missing columns read as null.
pub fn check_row_shape(table: &Table, row: &Row) -> Result<()> {
    if let Some(unknown) = row.payload.keys().find(|c| !table.has_column(c)) {
        return Err(Error::not_found(format!("column {}.{} does not exist", table.name, unknown)));
    }
    for column in &table.columns {
        let value = row.get(&column.name);
        if value.is_null() && !column.nullable {
            return Err(Error::not_null(&table.name, &column.name));
        }
        if !type_matches(column.data_type, value) {
            return Err(Error::invalid_argument(format!(
                "{}.{} expects {:?}, got {}",
                table.name, column.name, column.data_type, value
            )));
        }
    }
    Ok(())
}

/// Normalized name of the single-column unique index backing the parent side.
fn parent_index(schema: &Schema, fk: &ForeignKeySpec) -> Result<String> {
    schema
        .table(&fk.parent_table)?
        .unique_indices()
        .find(|i| i.columns.len() == 1 && i.columns[0].name == fk.parent_column)
        .map(|i| i.normalized_name())
        .ok_or_else(|| {
            Error::internal(format!(
                "foreign key {} has no unique parent index",
                fk.normalized_name()
            ))
        })
}

pub fn parent_exists(state: &InMemoryState, fk: &ForeignKeySpec, value: &Value) -> Result<bool> {
    let index = parent_index(&state.schema, fk)?;
    Ok(!state.lookup(&index, &Key::from(value.clone()))?.is_empty())
}

/// Child rows whose foreign-key column equals `value`.
pub fn children_of(state: &InMemoryState, fk: &ForeignKeySpec, value: &Value) -> Result<Vec<RowId>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    state.lookup(&fk.child_index_name(), &Key::from(value.clone()))
}

/// Child side: a non-null reference must name an existing parent row.
pub fn check_reference(state: &InMemoryState, fk: &ForeignKeySpec, row: &Row) -> Result<()> {
    let value = row.get(&fk.child_column);
    if value.is_null() || parent_exists(state, fk, value)? {
        return Ok(());
    }
    Err(Error::foreign_key(
        &fk.normalized_name(),
        format!(
            "{}.{} = {} has no matching {}.{}",
            fk.child_table, fk.child_column, value, fk.parent_table, fk.parent_column
        ),
    ))
}

/// Parent side: no child may still point at `value` once it is gone from
/// the parent table.
pub fn check_orphans(state: &InMemoryState, fk: &ForeignKeySpec, value: &Value) -> Result<()> {
    if value.is_null() || parent_exists(state, fk, value)? {
        return Ok(());
    }
    let orphans = children_of(state, fk, value)?;
    if orphans.is_empty() {
        return Ok(());
    }
    Err(Error::foreign_key(
        &fk.normalized_name(),
        format!(
            "{} row(s) of {} still reference {}.{} = {}",
            orphans.len(),
            fk.child_table,
            fk.parent_table,
            fk.parent_column,
            value
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::row;
    use crate::schema::schema::{ConstraintAction, ConstraintTiming, SchemaBuilder, TableBuilder};
    use std::sync::Arc;

    fn state() -> InMemoryState {
        let schema = SchemaBuilder::new("s", 1)
            .table(
                TableBuilder::new("dept")
                    .add_column("id", DataType::Integer)
                    .add_column("budget", DataType::Number)
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
            .build()
            .unwrap();
        let mut state = InMemoryState::new(Arc::new(schema), 8);
        state
            .load_table("dept", vec![row!("id" => 1, "budget" => 10).with_id(1)])
            .unwrap();
        state
            .load_table("emp", vec![row!("id" => 1, "dept_id" => 1).with_id(2)])
            .unwrap();
        state
    }

    #[test]
    fn test_row_shape() {
        let s = state();
        let dept = s.schema.table("dept").unwrap();
        check_row_shape(dept, &row!("id" => 2, "budget" => 1.5)).unwrap();
        // integers are accepted where numbers are expected
        check_row_shape(dept, &row!("id" => 2, "budget" => 3)).unwrap();

        let err = check_row_shape(dept, &row!("id" => 2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotNullViolation);
        let err = check_row_shape(dept, &row!("id" => "x", "budget" => 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = check_row_shape(dept, &row!("id" => 2, "budget" => 1, "extra" => 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_reference_and_orphans() {
        let s = state();
        let fk = &s.schema.table("emp").unwrap().foreign_keys[0];
        check_reference(&s, fk, &row!("id" => 5, "dept_id" => 1)).unwrap();
        check_reference(&s, fk, &row!("id" => 5, "dept_id" => Value::Null)).unwrap();
        let err = check_reference(&s, fk, &row!("id" => 5, "dept_id" => 9)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForeignKeyViolation);

        assert_eq!(children_of(&s, fk, &Value::Integer(1)).unwrap(), vec![2]);
        // parent 1 still exists
        check_orphans(&s, fk, &Value::Integer(1)).unwrap();
    }
}
