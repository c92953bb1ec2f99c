use crate::plan::logical::LogicalNode;
use crate::plan::physical::PhysicalNode;

/// Maps each logical operator to its default physical one.
pub fn lower(node: LogicalNode) -> PhysicalNode {
    let boxed = |n: Box<LogicalNode>| Box::new(lower(*n));
    match node {
        LogicalNode::TableAccess { table } => PhysicalNode::TableAccessFull { table },
        LogicalNode::CrossProduct { children } => PhysicalNode::CrossProduct {
            children: children.into_iter().map(lower).collect(),
        },
        LogicalNode::Join {
            left,
            right,
            predicate,
            outer,
        } => PhysicalNode::Join {
            left: boxed(left),
            right: boxed(right),
            predicate,
            outer,
        },
        LogicalNode::Select { predicate, child } => PhysicalNode::Select {
            predicate,
            child: boxed(child),
        },
        LogicalNode::GroupBy { columns, child } => PhysicalNode::GroupBy {
            columns,
            child: boxed(child),
        },
        LogicalNode::Aggregation { aggregates, child } => PhysicalNode::Aggregation {
            aggregates,
            child: boxed(child),
        },
        LogicalNode::OrderBy { terms, child } => PhysicalNode::OrderBy {
            terms,
            child: boxed(child),
        },
        LogicalNode::Skip { count, child } => PhysicalNode::Skip {
            count,
            child: boxed(child),
        },
        LogicalNode::Limit { count, child } => PhysicalNode::Limit {
            count,
            child: boxed(child),
        },
        LogicalNode::Project { columns, child } => PhysicalNode::Project {
            columns,
            child: boxed(child),
        },
        LogicalNode::Insert { table, rows, replace } => PhysicalNode::Insert { table, rows, replace },
        LogicalNode::Update { table, set, child } => PhysicalNode::Update {
            table,
            set,
            child: boxed(child),
        },
        LogicalNode::Delete { table, child } => PhysicalNode::Delete {
            table,
            child: boxed(child),
        },
    }
}
