use crate::core::error::{Error, Result};
use crate::plan::logical::LogicalNode;
use crate::query::builder::{resolve_count, DeleteQuery, JoinKind, Query, SelectQuery, UpdateQuery};
use crate::query::predicate::{and, Predicate};
use crate::query::relation::Aggregate;

/// Builds the unoptimized logical tree for a validated, fully bound query.
pub fn generate(query: &Query) -> Result<LogicalNode> {
    match query {
        Query::Select(q) => generate_select(q),
        Query::Insert(q) => Ok(LogicalNode::Insert {
            table: q.table.clone(),
            rows: q.rows.clone(),
            replace: q.replace,
        }),
        Query::Update(q) => generate_update(q),
        Query::Delete(q) => Ok(generate_delete(q)),
    }
}

fn scan(table: &str, filter: Option<&Predicate>) -> LogicalNode {
    let access = LogicalNode::TableAccess {
        table: table.to_string(),
    };
    match filter {
        Some(p) => LogicalNode::select(p.clone(), access),
        None => access,
    }
}

fn product(mut pending: Vec<LogicalNode>) -> Option<LogicalNode> {
    match pending.len() {
        0 => None,
        1 => pending.pop(),
        _ => Some(LogicalNode::CrossProduct { children: pending }),
    }
}

/// Inner tables collect into one cross product; every left outer join
/// closes the pending product and wraps it.
fn generate_sources(q: &SelectQuery, conjuncts: &mut Vec<Predicate>) -> Result<LogicalNode> {
    let mut pending: Vec<LogicalNode> = q.from.iter().map(|t| scan(t, None)).collect();
    let mut current: Option<LogicalNode> = None;

    for join in &q.joins {
        match join.kind {
            JoinKind::Inner => {
                pending.push(scan(&join.table, None));
                conjuncts.push(join.predicate.clone());
            }
            JoinKind::LeftOuter => {
                let join_pred = join
                    .predicate
                    .as_join()
                    .ok_or_else(|| Error::invalid_argument("outer join needs a column comparison"))?
                    .clone();
                let mut inputs: Vec<LogicalNode> = current.take().into_iter().collect();
                inputs.append(&mut pending);
                let left = product(inputs).ok_or_else(|| Error::internal("outer join without a left side"))?;
                current = Some(LogicalNode::Join {
                    left: Box::new(left),
                    right: Box::new(scan(&join.table, None)),
                    predicate: join_pred,
                    outer: true,
                });
            }
        }
    }

    let mut inputs: Vec<LogicalNode> = current.into_iter().collect();
    inputs.append(&mut pending);
    product(inputs).ok_or_else(|| Error::invalid_argument("select needs at least one table"))
}

fn generate_select(q: &SelectQuery) -> Result<LogicalNode> {
    let mut conjuncts = Vec::new();
    let mut node = generate_sources(q, &mut conjuncts)?;

    if let Some(p) = &q.where_clause {
        conjuncts.push(p.clone());
    }
    node = match conjuncts.len() {
        0 => node,
        1 => LogicalNode::select(conjuncts.remove(0), node),
        _ => LogicalNode::select(and(conjuncts), node),
    };

    if !q.group_by.is_empty() {
        node = LogicalNode::GroupBy {
            columns: q.group_by.clone(),
            child: Box::new(node),
        };
    }

    let mut aggregates: Vec<Aggregate> = Vec::new();
    let used = q
        .columns
        .iter()
        .chain(q.order_by.iter().map(|t| &t.projection))
        .filter_map(|p| p.aggregate());
    for a in used {
        if !aggregates.contains(a) {
            aggregates.push(a.clone());
        }
    }
    if !aggregates.is_empty() {
        node = LogicalNode::Aggregation {
            aggregates,
            child: Box::new(node),
        };
    }

    if !q.order_by.is_empty() {
        node = LogicalNode::OrderBy {
            terms: q.order_by.clone(),
            child: Box::new(node),
        };
    }
    if let Some(count) = resolve_count(&q.skip, "skip")?.filter(|n| *n > 0) {
        node = LogicalNode::Skip {
            count,
            child: Box::new(node),
        };
    }
    if let Some(count) = resolve_count(&q.limit, "limit")? {
        node = LogicalNode::Limit {
            count,
            child: Box::new(node),
        };
    }

    Ok(LogicalNode::Project {
        columns: q.columns.clone(),
        child: Box::new(node),
    })
}

fn generate_update(q: &UpdateQuery) -> Result<LogicalNode> {
    let set = q
        .set
        .iter()
        .map(|(c, v)| {
            v.bound()
                .cloned()
                .map(|v| (c.clone(), v))
                .ok_or_else(|| Error::invalid_argument(format!("value for {}.{} is not bound", q.table, c)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LogicalNode::Update {
        table: q.table.clone(),
        set,
        child: Box::new(scan(&q.table, q.where_clause.as_ref())),
    })
}

fn generate_delete(q: &DeleteQuery) -> LogicalNode {
    LogicalNode::Delete {
        table: q.table.clone(),
        child: Box::new(scan(&q.table, q.where_clause.as_ref())),
    }
}
