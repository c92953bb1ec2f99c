use std::collections::BTreeSet;
use crate::plan::logical::LogicalNode;
use crate::plan::rewrite::RewriteRule;
use crate::query::context::QueryContext;
use crate::query::predicate::Predicate;

/// Moves every select as close to the tables it reads as possible. A select
/// never moves into the null-padded side of an outer join.
pub struct PushDownSelectionsRule;

impl RewriteRule for PushDownSelectionsRule {
    fn name(&self) -> &str {
        "push_down_selections"
    }

    fn rewrite(&self, root: LogicalNode, _ctx: &QueryContext) -> LogicalNode {
        visit(root)
    }
}

fn visit(node: LogicalNode) -> LogicalNode {
    match node {
        LogicalNode::Select { predicate, child } => {
            let child = visit(*child);
            let tables = predicate.tables();
            push_into(predicate, &tables, child)
        }
        other => other.map_children(&mut visit),
    }
}

fn push_into(predicate: Predicate, tables: &BTreeSet<String>, node: LogicalNode) -> LogicalNode {
    match node {
        LogicalNode::Select { predicate: existing, child } => LogicalNode::Select {
            predicate: existing,
            child: Box::new(push_into(predicate, tables, *child)),
        },
        LogicalNode::CrossProduct { mut children } => {
            match children.iter().position(|c| tables.is_subset(&c.tables())) {
                Some(i) => {
                    let target = children.remove(i);
                    children.insert(i, push_into(predicate, tables, target));
                    LogicalNode::CrossProduct { children }
                }
                None => LogicalNode::select(predicate, LogicalNode::CrossProduct { children }),
            }
        }
        LogicalNode::Join {
            left,
            right,
            predicate: join,
            outer,
        } => {
            if tables.is_subset(&left.tables()) {
                LogicalNode::Join {
                    left: Box::new(push_into(predicate, tables, *left)),
                    right,
                    predicate: join,
                    outer,
                }
            } else if !outer && tables.is_subset(&right.tables()) {
                LogicalNode::Join {
                    left,
                    right: Box::new(push_into(predicate, tables, *right)),
                    predicate: join,
                    outer,
                }
            } else {
                LogicalNode::select(
                    predicate,
                    LogicalNode::Join {
                        left,
                        right,
                        predicate: join,
                        outer,
                    },
                )
            }
        }
        other => LogicalNode::select(predicate, other),
    }
}
