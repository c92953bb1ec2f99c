use crate::plan::optimize::{PhysicalRule, PlanEnv};
use crate::plan::physical::PhysicalNode;
use crate::query::predicate::{EvalType, JoinPredicate};
use crate::schema::schema::IndexDef;

/// Replaces an equi-join whose side is a plain table scan with per-entry
/// index probes into that table. An outer join may only probe its
/// null-padded side.
pub struct IndexJoinRule;

impl PhysicalRule for IndexJoinRule {
    fn name(&self) -> &str {
        "index_join"
    }

    fn optimize(&self, root: PhysicalNode, env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::Join {
                left,
                right,
                predicate,
                outer,
            } if predicate.eval == EvalType::Eq => {
                let predicate = predicate.oriented(&left.tables());
                let right_index = probe_index(env, &right, &predicate.right.name);
                let left_index = if outer {
                    None
                } else {
                    probe_index(env, &left, &predicate.left.name)
                };

                let probe_left = match (&left_index, &right_index) {
                    (Some(_), Some(_)) => table_rows(env, &left) > table_rows(env, &right),
                    (Some(_), None) => true,
                    _ => false,
                };
                match (probe_left, left_index, right_index, *left, *right) {
                    (true, Some(index), _, PhysicalNode::TableAccessFull { table }, driver) => {
                        index_join(driver, table, index, predicate.reversed(), false)
                    }
                    (false, _, Some(index), driver, PhysicalNode::TableAccessFull { table }) => {
                        index_join(driver, table, index, predicate, outer)
                    }
                    (_, _, _, left, right) => PhysicalNode::Join {
                        left: Box::new(left),
                        right: Box::new(right),
                        predicate,
                        outer,
                    },
                }
            }
            other => other,
        })
    }
}

fn index_join(driver: PhysicalNode, table: String, index: String, predicate: JoinPredicate, outer: bool) -> PhysicalNode {
    tracing::trace!(table = %table, index = %index, "index join");
    PhysicalNode::IndexJoin {
        driver: Box::new(driver),
        table,
        index,
        predicate,
        outer,
    }
}

/// An index led by `column` on the table `node` scans in full.
fn probe_index(env: &PlanEnv, node: &PhysicalNode, column: &str) -> Option<String> {
    let PhysicalNode::TableAccessFull { table } = node else {
        return None;
    };
    let def = env.ctx.schema.table(table).ok()?;
    def.all_indices()
        .find(|d: &&IndexDef| d.columns.first().is_some_and(|c| c.name == column))
        .map(IndexDef::normalized_name)
}

fn table_rows(env: &PlanEnv, node: &PhysicalNode) -> u64 {
    match node {
        PhysicalNode::TableAccessFull { table } => env.state.cache.count(table),
        _ => 0,
    }
}
