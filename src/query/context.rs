use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::query::builder::{resolve_count, Query, SelectQuery};
use crate::query::predicate::{Predicate, PredicateId};
use crate::query::relation::ColumnRef;
use crate::schema::schema::Schema;

/// What plan passes need to know about the query being compiled.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub schema: Arc<Schema>,
    /// Outer-join predicate ids mapped to their null-padded table.
    pub outer_joins: BTreeMap<PredicateId, String>,
    pub single_table: bool,
}

impl QueryContext {
    pub fn new(schema: Arc<Schema>, query: &Query) -> Self {
        let (outer_joins, single_table) = match query {
            Query::Select(q) => (q.outer_join_predicates(), q.is_single_table()),
            _ => (BTreeMap::new(), true),
        };
        QueryContext {
            schema,
            outer_joins,
            single_table,
        }
    }

    pub fn null_padded_tables(&self) -> BTreeSet<&str> {
        self.outer_joins.values().map(String::as_str).collect()
    }
}

fn check_column(schema: &Schema, tables: &BTreeSet<String>, column: &ColumnRef) -> Result<()> {
    if !tables.contains(&column.table) {
        return Err(Error::invalid_argument(format!(
            "column {} references a table the query does not read",
            column
        )));
    }
    let table = schema.table(&column.table)?;
    if !table.has_column(&column.name) {
        return Err(Error::not_found(format!("column {} does not exist", column)));
    }
    Ok(())
}

fn check_predicate(schema: &Schema, tables: &BTreeSet<String>, predicate: &Predicate) -> Result<()> {
    if !predicate.is_bound() {
        return Err(Error::invalid_argument(format!("predicate {} has unbound parameters", predicate)));
    }
    predicate.validate()?;
    for column in predicate.columns() {
        check_column(schema, tables, column)?;
    }
    Ok(())
}

fn validate_select(schema: &Schema, q: &SelectQuery) -> Result<()> {
    if q.from.is_empty() {
        return Err(Error::invalid_argument("select needs at least one table"));
    }
    let mut tables = BTreeSet::new();
    for name in q.tables() {
        schema.table(&name)?;
        if !tables.insert(name.clone()) {
            return Err(Error::invalid_argument(format!("table {} is read twice", name)));
        }
    }

    let mut seen = BTreeSet::new();
    for name in &q.from {
        seen.insert(name.clone());
    }
    for join in &q.joins {
        seen.insert(join.table.clone());
        if join.predicate.as_join().is_none() {
            return Err(Error::invalid_argument(format!(
                "join on {} needs a column comparison, got {}",
                join.table, join.predicate
            )));
        }
        check_predicate(schema, &seen, &join.predicate)?;
        if !join.predicate.tables().contains(&join.table) {
            return Err(Error::invalid_argument(format!(
                "join predicate {} does not reference {}",
                join.predicate, join.table
            )));
        }
    }

    if let Some(p) = &q.where_clause {
        check_predicate(schema, &tables, p)?;
    }
    for projection in &q.columns {
        if let Some(c) = projection.column() {
            check_column(schema, &tables, c)?;
        }
    }
    for term in &q.order_by {
        if let Some(c) = term.projection.column() {
            check_column(schema, &tables, c)?;
        }
    }
    for c in &q.group_by {
        check_column(schema, &tables, c)?;
    }
    resolve_count(&q.limit, "limit")?;
    resolve_count(&q.skip, "skip")?;
    Ok(())
}

/// Checks table and column references against the schema, and that every
/// placeholder has been bound.
pub fn validate(schema: &Schema, query: &Query) -> Result<()> {
    match query {
        Query::Select(q) => validate_select(schema, q),
        Query::Insert(q) => {
            let table = schema.table(&q.table)?;
            for row in &q.rows {
                if let Some(unknown) = row.payload.keys().find(|c| !table.has_column(c)) {
                    return Err(Error::not_found(format!("column {}.{} does not exist", q.table, unknown)));
                }
            }
            Ok(())
        }
        Query::Update(q) => {
            let table = schema.table(&q.table)?;
            let tables = BTreeSet::from([q.table.clone()]);
            for (column, value) in &q.set {
                if !table.has_column(column) {
                    return Err(Error::not_found(format!("column {}.{} does not exist", q.table, column)));
                }
                if value.bound().is_none() {
                    return Err(Error::invalid_argument(format!(
                        "value for {}.{} is not bound",
                        q.table, column
                    )));
                }
            }
            match &q.where_clause {
                Some(p) => check_predicate(schema, &tables, p),
                None => Ok(()),
            }
        }
        Query::Delete(q) => {
            schema.table(&q.table)?;
            let tables = BTreeSet::from([q.table.clone()]);
            match &q.where_clause {
                Some(p) => check_predicate(schema, &tables, p),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::query::builder::{SelectQuery, UpdateQuery};
    use crate::query::predicate::param;
    use crate::query::relation::col;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};

    fn schema() -> Schema {
        SchemaBuilder::new("s", 1)
            .table(TableBuilder::new("a").add_column("id", DataType::Integer))
            .table(TableBuilder::new("b").add_column("a_id", DataType::Integer))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_names() {
        let s = schema();
        let q = SelectQuery::new(vec![]).from("zzz").into_query();
        assert_eq!(validate(&s, &q).unwrap_err().kind, ErrorKind::NotFound);

        let q = SelectQuery::new(vec![col("a", "nope").into()]).from("a").into_query();
        assert_eq!(validate(&s, &q).unwrap_err().kind, ErrorKind::NotFound);

        let q = SelectQuery::new(vec![col("b", "a_id").into()]).from("a").into_query();
        assert_eq!(validate(&s, &q).unwrap_err().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_unbound_rejected() {
        let s = schema();
        let q = UpdateQuery::table("a").set("id", param(0)).into_query();
        assert_eq!(validate(&s, &q).unwrap_err().kind, ErrorKind::InvalidArgument);
        let bound = q.bind(&[crate::core::types::Value::Integer(1)]).unwrap();
        validate(&s, &bound).unwrap();
    }

    #[test]
    fn test_join_must_reference_joined_table() {
        let s = schema();
        let q = SelectQuery::new(vec![])
            .from("a")
            .inner_join("b", col("b", "a_id").eq_col(col("a", "id")))
            .into_query();
        validate(&s, &q).unwrap();
    }
}
