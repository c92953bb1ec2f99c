use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use crate::core::error::{Error, Result};
use crate::core::types::{Row, RowId, Value, DUMMY_ID};
use crate::index::key_range::SingleKeyRange;
use crate::plan::physical::{PhysicalNode, PhysicalPlan, RowIdSource};
use crate::query::builder::OrderTerm;
use crate::query::context::QueryContext;
use crate::query::relation::{Projection, Relation, RelationEntry};
use crate::schema::schema::Order;
use crate::storage::state::InMemoryState;
use crate::txn::journal::Journal;

/// Runs a compiled plan. Reads go straight against `state`; writes go
/// through `journal`, which records them and enforces constraints.
pub fn execute(plan: &PhysicalPlan, state: &mut InMemoryState, journal: &mut Journal) -> Result<Vec<Row>> {
    match &plan.root {
        PhysicalNode::Insert { table, rows, replace } => {
            if *replace {
                journal.insert_or_replace(state, table, rows.clone())
            } else {
                journal.insert(state, table, rows.clone())
            }
        }
        PhysicalNode::Update { table, set, child } => {
            let rows = Executor::new(state, &plan.context).rows_of(child, table)?;
            let updated: Vec<Row> = rows
                .into_iter()
                .map(|mut row| {
                    for (column, value) in set {
                        row.set(column.as_str(), value.clone());
                    }
                    row
                })
                .collect();
            journal.update(state, table, updated.clone())?;
            Ok(updated)
        }
        PhysicalNode::Delete { table, child } => {
            let rows = Executor::new(state, &plan.context).rows_of(child, table)?;
            journal.remove(state, table, rows.clone())?;
            Ok(rows)
        }
        _ => read(plan, state),
    }
}

/// Runs a select plan.
pub fn read(plan: &PhysicalPlan, state: &InMemoryState) -> Result<Vec<Row>> {
    let executor = Executor::new(state, &plan.context);
    match &plan.root {
        PhysicalNode::Project { columns, child } => {
            let relations = executor.evaluate(child)?;
            Ok(executor.project(columns, relations))
        }
        other => Err(Error::internal(format!(
            "read plan must end in a projection, got {}",
            other
        ))),
    }
}

pub struct Executor<'a> {
    state: &'a InMemoryState,
    ctx: &'a QueryContext,
}

impl<'a> Executor<'a> {
    pub fn new(state: &'a InMemoryState, ctx: &'a QueryContext) -> Self {
        Executor { state, ctx }
    }

    fn rows_of(&self, node: &PhysicalNode, table: &str) -> Result<Vec<Row>> {
        Ok(self
            .evaluate(node)?
            .into_iter()
            .flat_map(|r| r.entries)
            .filter_map(|e| e.into_row(table))
            .collect())
    }

    fn single(&self, node: &PhysicalNode) -> Result<Relation> {
        let mut relations = self.evaluate(node)?;
        match relations.len() {
            1 => Ok(relations.remove(0)),
            n => Err(Error::internal(format!("expected one relation from {}, got {}", node, n))),
        }
    }

    fn scan_ids(&self, source: &RowIdSource) -> Result<Vec<RowId>> {
        match source {
            RowIdSource::Index(scan) => Ok(self.state.index(&scan.index)?.get_range(
                scan.ranges.as_deref(),
                scan.reverse,
                scan.limit,
                scan.skip,
            )),
            RowIdSource::Union(scans) => {
                let mut seen = BTreeSet::new();
                let mut ids = Vec::new();
                for scan in scans {
                    let index = self.state.index(&scan.index)?;
                    for id in index.get_range(scan.ranges.as_deref(), scan.reverse, scan.limit, scan.skip) {
                        if seen.insert(id) {
                            ids.push(id);
                        }
                    }
                }
                Ok(ids)
            }
        }
    }

    pub fn evaluate(&self, node: &PhysicalNode) -> Result<Vec<Relation>> {
        match node {
            PhysicalNode::TableAccessFull { table } => {
                Ok(vec![Relation::from_rows(table, self.state.cache.table_rows(table))])
            }
            PhysicalNode::TableAccessByRowId { table, source } => {
                let ids = self.scan_ids(source)?;
                Ok(vec![Relation::from_rows(table, self.state.cache.get_many(&ids))])
            }
            PhysicalNode::GetRowCount { table, aggregate } => {
                let def = self.ctx.schema.table(table)?;
                let count = self.state.index(&def.row_id_index_name())?.stats().total_rows;
                let mut relation = Relation::with_entries(BTreeSet::from([table.clone()]), Vec::new());
                relation.aggregates.insert(aggregate.name(), Value::Integer(count as i64));
                relation.grouped = true;
                Ok(vec![relation])
            }
            PhysicalNode::Select { predicate, child } => Ok(self
                .evaluate(child)?
                .into_iter()
                .map(|r| predicate.filter(r))
                .collect()),
            PhysicalNode::CrossProduct { children } => {
                let mut acc: Option<Relation> = None;
                for child in children {
                    let next = self.single(child)?;
                    acc = Some(match acc {
                        None => next,
                        Some(prev) => cross(&prev, &next),
                    });
                }
                acc.map(|r| vec![r])
                    .ok_or_else(|| Error::internal("cross product without inputs"))
            }
            PhysicalNode::Join {
                left,
                right,
                predicate,
                outer,
            } => {
                let left = self.single(left)?;
                let right = self.single(right)?;
                Ok(vec![predicate.join(&left, &right, *outer)])
            }
            PhysicalNode::IndexJoin {
                driver,
                table,
                index,
                predicate,
                outer,
            } => {
                let driver = self.single(driver)?;
                let index = self.state.index(index)?;
                let mut entries = Vec::new();
                for entry in &driver.entries {
                    let value = entry.get(&predicate.left);
                    let ids = if value.is_null() {
                        Vec::new()
                    } else {
                        let range = vec![SingleKeyRange::only(value.clone())];
                        index.get_range(Some(std::slice::from_ref(&range)), false, None, None)
                    };
                    let matches = self.state.cache.get_many(&ids);
                    if matches.is_empty() && *outer {
                        entries.push(entry.clone());
                    }
                    for row in matches {
                        entries.push(RelationEntry::combine(entry, &RelationEntry::from_row(table, row)));
                    }
                }
                let mut tables = driver.tables.clone();
                tables.insert(table.clone());
                Ok(vec![Relation::with_entries(tables, entries)])
            }
            PhysicalNode::GroupBy { columns, child } => {
                let input = self.single(child)?;
                let mut groups: BTreeMap<Vec<Value>, Vec<RelationEntry>> = BTreeMap::new();
                for entry in input.entries {
                    let key = columns.iter().map(|c| entry.get(c).clone()).collect();
                    groups.entry(key).or_default().push(entry);
                }
                Ok(groups
                    .into_values()
                    .map(|entries| {
                        let mut group = Relation::with_entries(input.tables.clone(), entries);
                        group.grouped = true;
                        group
                    })
                    .collect())
            }
            PhysicalNode::Aggregation { aggregates, child } => {
                let mut relations = self.evaluate(child)?;
                for relation in &mut relations {
                    for aggregate in aggregates {
                        let value = aggregate.evaluate(relation);
                        relation.aggregates.insert(aggregate.name(), value);
                    }
                    relation.grouped = true;
                }
                Ok(relations)
            }
            PhysicalNode::OrderBy { terms, child } => {
                let mut relations = self.evaluate(child)?;
                if relations.iter().any(|r| r.grouped) {
                    relations.sort_by(|a, b| compare_terms(terms, |p| group_value(a, p), |p| group_value(b, p)));
                } else {
                    for relation in &mut relations {
                        relation
                            .entries
                            .sort_by(|a, b| compare_terms(terms, |p| entry_value(a, p), |p| entry_value(b, p)));
                    }
                }
                Ok(relations)
            }
            PhysicalNode::Skip { count, child } => self.page(child, *count, usize::MAX),
            PhysicalNode::Limit { count, child } => self.page(child, 0, *count),
            PhysicalNode::Project { .. }
            | PhysicalNode::Insert { .. }
            | PhysicalNode::Update { .. }
            | PhysicalNode::Delete { .. } => Err(Error::internal(format!(
                "{} cannot feed another step",
                node
            ))),
        }
    }

    fn page(&self, child: &PhysicalNode, skip: usize, take: usize) -> Result<Vec<Relation>> {
        let relations = self.evaluate(child)?;
        if relations.iter().any(|r| r.grouped) {
            return Ok(relations.into_iter().skip(skip).take(take).collect());
        }
        Ok(relations
            .into_iter()
            .map(|mut r| {
                r.entries = r.entries.into_iter().skip(skip).take(take).collect();
                r
            })
            .collect())
    }

    /// Turns relations into output rows.
    pub fn project(&self, columns: &[Projection], relations: Vec<Relation>) -> Vec<Row> {
        let single = self.ctx.single_table;
        let mut out = Vec::new();
        for relation in relations {
            if relation.grouped {
                let first = relation.entries.first();
                if columns.is_empty() {
                    if let Some(entry) = first {
                        out.push(self.full_row(entry.clone(), &relation.tables));
                    }
                    continue;
                }
                let payload = columns
                    .iter()
                    .map(|p| {
                        let value = match p {
                            Projection::Column { column, .. } => first.map_or(Value::Null, |e| e.get(column).clone()),
                            Projection::Aggregate { aggregate, .. } => {
                                relation.aggregates.get(&aggregate.name()).cloned().unwrap_or(Value::Null)
                            }
                        };
                        (p.output_name(single), value)
                    })
                    .collect();
                out.push(Row::dummy(payload));
                continue;
            }

            for entry in relation.entries {
                if columns.is_empty() {
                    out.push(self.full_row(entry, &relation.tables));
                    continue;
                }
                let id = match (single, entry.rows().next()) {
                    (true, Some((_, row))) => row.id,
                    _ => DUMMY_ID,
                };
                let payload = columns
                    .iter()
                    .map(|p| {
                        let value = match p {
                            Projection::Column { column, .. } => entry.get(column).clone(),
                            Projection::Aggregate { .. } => Value::Null,
                        };
                        (p.output_name(single), value)
                    })
                    .collect();
                out.push(Row::new(id, payload));
            }
        }
        out
    }

    /// Every column of every table in the entry. A single table keeps its
    /// stored row; several tables are flattened to `table.column` keys with
    /// the null-padded side filled with nulls.
    fn full_row(&self, entry: RelationEntry, tables: &BTreeSet<String>) -> Row {
        if self.ctx.single_table {
            if let Some(row) = tables.iter().next().and_then(|t| entry.row(t)) {
                return row.clone();
            }
        }
        let mut payload = BTreeMap::new();
        for table in tables {
            let Ok(def) = self.ctx.schema.table(table) else {
                continue;
            };
            let row = entry.row(table);
            for column in &def.columns {
                let value = row.map_or(Value::Null, |r| r.get(&column.name).clone());
                payload.insert(format!("{}.{}", table, column.name), value);
            }
        }
        Row::dummy(payload)
    }
}

fn cross(left: &Relation, right: &Relation) -> Relation {
    let mut entries = Vec::with_capacity(left.len() * right.len());
    for l in &left.entries {
        for r in &right.entries {
            entries.push(RelationEntry::combine(l, r));
        }
    }
    let tables = left.tables.union(&right.tables).cloned().collect();
    Relation::with_entries(tables, entries)
}

fn entry_value(entry: &RelationEntry, projection: &Projection) -> Value {
    match projection {
        Projection::Column { column, .. } => entry.get(column).clone(),
        Projection::Aggregate { .. } => Value::Null,
    }
}

fn group_value(relation: &Relation, projection: &Projection) -> Value {
    match projection {
        Projection::Column { column, .. } => relation
            .entries
            .first()
            .map_or(Value::Null, |e| e.get(column).clone()),
        Projection::Aggregate { aggregate, .. } => relation
            .aggregates
            .get(&aggregate.name())
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn compare_terms(
    terms: &[OrderTerm],
    a: impl Fn(&Projection) -> Value,
    b: impl Fn(&Projection) -> Value,
) -> Ordering {
    for term in terms {
        let ord = a(&term.projection).cmp(&b(&term.projection));
        let ord = match term.order {
            Order::Asc => ord,
            Order::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
