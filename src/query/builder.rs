use std::collections::BTreeMap;
use crate::core::error::{Error, Result};
use crate::core::types::{Row, Value};
use crate::query::predicate::{and, Bindable, IntoBindable, Predicate, PredicateId};
use crate::query::relation::{ColumnRef, Projection};
use crate::schema::schema::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

/// A table joined after the first `from` table.
#[derive(Debug, Clone)]
pub struct JoinClause {
    pub table: String,
    pub kind: JoinKind,
    pub predicate: Predicate,
}

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub projection: Projection,
    pub order: Order,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    /// Empty selects every column.
    pub columns: Vec<Projection>,
    pub from: Vec<String>,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<Predicate>,
    pub order_by: Vec<OrderTerm>,
    pub group_by: Vec<ColumnRef>,
    pub limit: Option<Bindable>,
    pub skip: Option<Bindable>,
}

impl SelectQuery {
    pub fn new(columns: Vec<Projection>) -> Self {
        SelectQuery {
            columns,
            ..Default::default()
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.from.push(table.to_string());
        self
    }

    pub fn inner_join(mut self, table: &str, predicate: Predicate) -> Self {
        self.joins.push(JoinClause {
            table: table.to_string(),
            kind: JoinKind::Inner,
            predicate,
        });
        self
    }

    pub fn left_outer_join(mut self, table: &str, predicate: Predicate) -> Self {
        self.joins.push(JoinClause {
            table: table.to_string(),
            kind: JoinKind::LeftOuter,
            predicate,
        });
        self
    }

    /// Repeated calls are combined with `and`.
    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => and(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, projection: impl Into<Projection>, order: Order) -> Self {
        self.order_by.push(OrderTerm {
            projection: projection.into(),
            order,
        });
        self
    }

    pub fn group_by(mut self, columns: Vec<ColumnRef>) -> Self {
        self.group_by.extend(columns);
        self
    }

    pub fn limit(mut self, n: impl IntoBindable) -> Self {
        self.limit = Some(n.into_bindable());
        self
    }

    pub fn skip(mut self, n: impl IntoBindable) -> Self {
        self.skip = Some(n.into_bindable());
        self
    }

    /// Every table the query reads, in from-then-join order.
    pub fn tables(&self) -> Vec<String> {
        self.from
            .iter()
            .cloned()
            .chain(self.joins.iter().map(|j| j.table.clone()))
            .collect()
    }

    pub fn is_single_table(&self) -> bool {
        self.from.len() + self.joins.len() == 1
    }

    /// Ids of join predicates whose right side is null-padded, mapped to that table.
    pub fn outer_join_predicates(&self) -> BTreeMap<PredicateId, String> {
        self.joins
            .iter()
            .filter(|j| j.kind == JoinKind::LeftOuter)
            .map(|j| (j.predicate.id(), j.table.clone()))
            .collect()
    }

    pub fn has_aggregates(&self) -> bool {
        self.columns.iter().any(|p| p.aggregate().is_some())
    }

    pub fn into_query(self) -> Query {
        Query::Select(self)
    }
}

#[derive(Debug, Clone)]
pub struct InsertQuery {
    pub table: String,
    pub rows: Vec<Row>,
    /// Replace rows whose primary key already exists.
    pub replace: bool,
}

impl InsertQuery {
    pub fn into_table(table: &str) -> Self {
        InsertQuery {
            table: table.to_string(),
            rows: Vec::new(),
            replace: false,
        }
    }

    pub fn or_replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn values(mut self, rows: Vec<Row>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn into_query(self) -> Query {
        Query::Insert(self)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateQuery {
    pub table: String,
    pub set: Vec<(String, Bindable)>,
    pub where_clause: Option<Predicate>,
}

impl UpdateQuery {
    pub fn table(table: &str) -> Self {
        UpdateQuery {
            table: table.to_string(),
            set: Vec::new(),
            where_clause: None,
        }
    }

    pub fn set(mut self, column: &str, value: impl IntoBindable) -> Self {
        self.set.push((column.to_string(), value.into_bindable()));
        self
    }

    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => and(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn into_query(self) -> Query {
        Query::Update(self)
    }
}

#[derive(Debug, Clone)]
pub struct DeleteQuery {
    pub table: String,
    pub where_clause: Option<Predicate>,
}

impl DeleteQuery {
    pub fn from(table: &str) -> Self {
        DeleteQuery {
            table: table.to_string(),
            where_clause: None,
        }
    }

    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => and(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn into_query(self) -> Query {
        Query::Delete(self)
    }
}

#[derive(Debug, Clone)]
pub enum Query {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

fn bind_opt(p: &Option<Predicate>, params: &[Value]) -> Result<Option<Predicate>> {
    p.as_ref().map(|p| p.bind(params)).transpose()
}

fn bind_count(b: &Option<Bindable>, params: &[Value]) -> Result<Option<Bindable>> {
    b.as_ref().map(|b| b.bind(params)).transpose()
}

/// A bound limit or skip value.
pub fn resolve_count(b: &Option<Bindable>, what: &str) -> Result<Option<usize>> {
    match b {
        None => Ok(None),
        Some(Bindable::Value(Value::Integer(n))) if *n >= 0 => Ok(Some(*n as usize)),
        Some(Bindable::Param(i)) => Err(Error::invalid_argument(format!("{} parameter {} is not bound", what, i))),
        Some(Bindable::Value(v)) => Err(Error::invalid_argument(format!(
            "{} must be a non-negative integer, got {}",
            what, v
        ))),
    }
}

impl Query {
    /// Tables written by this query; empty for selects.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            Query::Select(_) => None,
            Query::Insert(q) => Some(&q.table),
            Query::Update(q) => Some(&q.table),
            Query::Delete(q) => Some(&q.table),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Query::Select(_))
    }

    /// Tables the query touches directly.
    pub fn tables(&self) -> Vec<String> {
        match self {
            Query::Select(q) => q.tables(),
            Query::Insert(q) => vec![q.table.clone()],
            Query::Update(q) => vec![q.table.clone()],
            Query::Delete(q) => vec![q.table.clone()],
        }
    }

    /// Copy with every placeholder replaced by `params[i]`.
    pub fn bind(&self, params: &[Value]) -> Result<Query> {
        Ok(match self {
            Query::Select(q) => Query::Select(SelectQuery {
                where_clause: bind_opt(&q.where_clause, params)?,
                joins: q
                    .joins
                    .iter()
                    .map(|j| {
                        Ok(JoinClause {
                            predicate: j.predicate.bind(params)?,
                            ..j.clone()
                        })
                    })
                    .collect::<Result<_>>()?,
                limit: bind_count(&q.limit, params)?,
                skip: bind_count(&q.skip, params)?,
                ..q.clone()
            }),
            Query::Insert(q) => Query::Insert(q.clone()),
            Query::Update(q) => Query::Update(UpdateQuery {
                set: q
                    .set
                    .iter()
                    .map(|(c, v)| Ok((c.clone(), v.bind(params)?)))
                    .collect::<Result<_>>()?,
                where_clause: bind_opt(&q.where_clause, params)?,
                table: q.table.clone(),
            }),
            Query::Delete(q) => Query::Delete(DeleteQuery {
                table: q.table.clone(),
                where_clause: bind_opt(&q.where_clause, params)?,
            }),
        })
    }
}

impl From<SelectQuery> for Query {
    fn from(q: SelectQuery) -> Self {
        Query::Select(q)
    }
}

impl From<InsertQuery> for Query {
    fn from(q: InsertQuery) -> Self {
        Query::Insert(q)
    }
}

impl From<UpdateQuery> for Query {
    fn from(q: UpdateQuery) -> Self {
        Query::Update(q)
    }
}

impl From<DeleteQuery> for Query {
    fn from(q: DeleteQuery) -> Self {
        Query::Delete(q)
    }
}
