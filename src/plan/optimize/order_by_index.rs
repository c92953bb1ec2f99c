use crate::plan::optimize::{unwrap_selects, wrap_selects, PhysicalRule, PlanEnv};
use crate::plan::physical::{IndexRangeScan, PhysicalNode, RowIdSource};
use crate::query::builder::OrderTerm;
use crate::query::relation::Projection;
use crate::schema::schema::IndexDef;

/// Drops a sort the index walk already produces, reversing the walk when
/// every term runs against the index order.
pub struct OrderByIndexRule;

impl PhysicalRule for OrderByIndexRule {
    fn name(&self) -> &str {
        "order_by_index"
    }

    fn optimize(&self, root: PhysicalNode, env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::OrderBy { terms, child } => {
                let (predicates, base) = unwrap_selects(*child);
                match sorted_access(&terms, base, env) {
                    Ok(access) => wrap_selects(predicates, access),
                    Err(base) => PhysicalNode::OrderBy {
                        terms,
                        child: Box::new(wrap_selects(predicates, base)),
                    },
                }
            }
            other => other,
        })
    }
}

/// `Some(reverse)` when walking `def` yields rows ordered by `terms`.
fn walk_direction(terms: &[OrderTerm], def: &IndexDef) -> Option<bool> {
    if terms.is_empty() || terms.len() > def.columns.len() {
        return None;
    }
    let mut natural = true;
    let mut reversed = true;
    for (term, indexed) in terms.iter().zip(&def.columns) {
        let Projection::Column { column, .. } = &term.projection else {
            return None;
        };
        if column.table != def.table || column.name != indexed.name {
            return None;
        }
        natural &= term.order == indexed.order;
        reversed &= term.order == indexed.order.reverse();
    }
    match (natural, reversed) {
        (true, _) => Some(false),
        (false, true) => Some(true),
        _ => None,
    }
}

fn sorted_access(terms: &[OrderTerm], base: PhysicalNode, env: &PlanEnv) -> Result<PhysicalNode, PhysicalNode> {
    match base {
        PhysicalNode::TableAccessByRowId {
            table,
            source: RowIdSource::Index(mut scan),
        } => {
            let direction = env
                .ctx
                .schema
                .table(&table)
                .ok()
                .and_then(|t| t.index(&scan.index))
                .and_then(|def| walk_direction(terms, def));
            match direction {
                Some(reverse) if !scan.reverse && scan.limit.is_none() && scan.skip.is_none() => {
                    scan.reverse = reverse;
                    Ok(PhysicalNode::TableAccessByRowId {
                        table,
                        source: RowIdSource::Index(scan),
                    })
                }
                _ => Err(PhysicalNode::TableAccessByRowId {
                    table,
                    source: RowIdSource::Index(scan),
                }),
            }
        }
        PhysicalNode::TableAccessFull { table } => {
            let found = env.ctx.schema.table(&table).ok().and_then(|t| {
                t.all_indices()
                    .find_map(|def| walk_direction(terms, def).map(|rev| (def.normalized_name(), rev)))
            });
            match found {
                Some((index, reverse)) => {
                    let mut scan = IndexRangeScan::new(index, None);
                    scan.reverse = reverse;
                    Ok(PhysicalNode::TableAccessByRowId {
                        table,
                        source: RowIdSource::Index(scan),
                    })
                }
                None => Err(PhysicalNode::TableAccessFull { table }),
            }
        }
        other => Err(other),
    }
}
