use crate::plan::cost::choose_index;
use crate::plan::optimize::{unwrap_selects, wrap_selects, PhysicalRule, PlanEnv};
use crate::plan::physical::{IndexRangeScan, PhysicalNode, RowIdSource};
use crate::query::predicate::Predicate;

/// Answers the selects over a full table scan with a range scan of the
/// cheapest fitting index. Predicates the ranges do not cover stay as selects.
pub struct IndexRangeScanRule;

impl PhysicalRule for IndexRangeScanRule {
    fn name(&self) -> &str {
        "index_range_scan"
    }

    fn optimize(&self, root: PhysicalNode, env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::Select { .. } => {
                let (predicates, base) = unwrap_selects(node);
                match base {
                    PhysicalNode::TableAccessFull { table } => scan_table(table, predicates, env),
                    other => wrap_selects(predicates, other),
                }
            }
            other => other,
        })
    }
}

fn scan_table(table: String, predicates: Vec<Predicate>, env: &PlanEnv) -> PhysicalNode {
    let Ok(def) = env.ctx.schema.table(&table) else {
        return wrap_selects(predicates, PhysicalNode::TableAccessFull { table });
    };
    let chosen = {
        let refs: Vec<&Predicate> = predicates.iter().collect();
        choose_index(env.state, def, &refs).map(|c| {
            (
                c.consumed(),
                IndexRangeScan::new(c.def.normalized_name(), Some(c.key_ranges())),
            )
        })
    };
    match chosen {
        Some((consumed, scan)) => {
            tracing::trace!(table = %table, index = %scan.index, "index range scan");
            let rest = predicates.into_iter().filter(|p| !consumed.contains(&p.id())).collect();
            wrap_selects(
                rest,
                PhysicalNode::TableAccessByRowId {
                    table,
                    source: RowIdSource::Index(scan),
                },
            )
        }
        None => wrap_selects(predicates, PhysicalNode::TableAccessFull { table }),
    }
}
