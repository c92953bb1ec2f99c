use crate::plan::cost::choose_index;
use crate::plan::optimize::{unwrap_selects, wrap_selects, PhysicalRule, PlanEnv};
use crate::plan::physical::{IndexRangeScan, PhysicalNode, RowIdSource};
use crate::query::predicate::{CombinedOp, Predicate};
use crate::schema::schema::Table;

/// Serves a disjunction over different columns by unioning one index scan
/// per branch. Gives up unless every branch has an index.
pub struct MultiColumnOrRule;

impl PhysicalRule for MultiColumnOrRule {
    fn name(&self) -> &str {
        "multi_column_or"
    }

    fn optimize(&self, root: PhysicalNode, env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::Select { .. } => {
                let (mut predicates, base) = unwrap_selects(node);
                let table = match base {
                    PhysicalNode::TableAccessFull { table } => table,
                    other => return wrap_selects(predicates, other),
                };
                let Ok(def) = env.ctx.schema.table(&table) else {
                    return wrap_selects(predicates, PhysicalNode::TableAccessFull { table });
                };
                let found = predicates
                    .iter()
                    .enumerate()
                    .find_map(|(i, p)| union_scans(def, p, env).map(|scans| (i, scans)));
                match found {
                    Some((i, scans)) => {
                        predicates.remove(i);
                        wrap_selects(
                            predicates,
                            PhysicalNode::TableAccessByRowId {
                                table,
                                source: RowIdSource::Union(scans),
                            },
                        )
                    }
                    None => wrap_selects(predicates, PhysicalNode::TableAccessFull { table }),
                }
            }
            other => other,
        })
    }
}

fn union_scans(table: &Table, predicate: &Predicate, env: &PlanEnv) -> Option<Vec<IndexRangeScan>> {
    let Predicate::Combined(or) = predicate else {
        return None;
    };
    if or.op != CombinedOp::Or || predicate.is_key_range_compatible() {
        return None;
    }
    or.children
        .iter()
        .map(|branch| {
            let candidate = choose_index(env.state, table, &[branch])?;
            Some(IndexRangeScan::new(
                candidate.def.normalized_name(),
                Some(candidate.key_ranges()),
            ))
        })
        .collect()
}
