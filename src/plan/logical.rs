use std::collections::BTreeSet;
use std::fmt;
use crate::core::types::{Row, Value};
use crate::query::builder::OrderTerm;
use crate::query::predicate::{JoinPredicate, Predicate};
use crate::query::relation::{Aggregate, ColumnRef, Projection};

/// Logical operator tree. Each node owns its children.
#[derive(Debug, Clone)]
pub enum LogicalNode {
    TableAccess {
        table: String,
    },
    CrossProduct {
        children: Vec<LogicalNode>,
    },
    Join {
        left: Box<LogicalNode>,
        right: Box<LogicalNode>,
        predicate: JoinPredicate,
        outer: bool,
    },
    Select {
        predicate: Predicate,
        child: Box<LogicalNode>,
    },
    GroupBy {
        columns: Vec<ColumnRef>,
        child: Box<LogicalNode>,
    },
    Aggregation {
        aggregates: Vec<Aggregate>,
        child: Box<LogicalNode>,
    },
    OrderBy {
        terms: Vec<OrderTerm>,
        child: Box<LogicalNode>,
    },
    Skip {
        count: usize,
        child: Box<LogicalNode>,
    },
    Limit {
        count: usize,
        child: Box<LogicalNode>,
    },
    Project {
        columns: Vec<Projection>,
        child: Box<LogicalNode>,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
        replace: bool,
    },
    Update {
        table: String,
        set: Vec<(String, Value)>,
        child: Box<LogicalNode>,
    },
    Delete {
        table: String,
        child: Box<LogicalNode>,
    },
}

impl LogicalNode {
    pub fn select(predicate: Predicate, child: LogicalNode) -> LogicalNode {
        LogicalNode::Select {
            predicate,
            child: Box::new(child),
        }
    }

    /// Tables whose rows flow out of this node.
    pub fn tables(&self) -> BTreeSet<String> {
        match self {
            LogicalNode::TableAccess { table } => BTreeSet::from([table.clone()]),
            LogicalNode::Insert { table, .. } => BTreeSet::from([table.clone()]),
            LogicalNode::CrossProduct { children } => children.iter().flat_map(|c| c.tables()).collect(),
            LogicalNode::Join { left, right, .. } => {
                let mut t = left.tables();
                t.extend(right.tables());
                t
            }
            LogicalNode::Select { child, .. }
            | LogicalNode::GroupBy { child, .. }
            | LogicalNode::Aggregation { child, .. }
            | LogicalNode::OrderBy { child, .. }
            | LogicalNode::Skip { child, .. }
            | LogicalNode::Limit { child, .. }
            | LogicalNode::Project { child, .. }
            | LogicalNode::Update { child, .. }
            | LogicalNode::Delete { child, .. } => child.tables(),
        }
    }

    /// Rebuilds this node with `f` applied to each direct child.
    pub fn map_children(self, f: &mut impl FnMut(LogicalNode) -> LogicalNode) -> LogicalNode {
        let mut wrap = |c: Box<LogicalNode>| Box::new(f(*c));
        match self {
            leaf @ (LogicalNode::TableAccess { .. } | LogicalNode::Insert { .. }) => leaf,
            LogicalNode::CrossProduct { children } => LogicalNode::CrossProduct {
                children: children.into_iter().map(|c| *wrap(Box::new(c))).collect(),
            },
            LogicalNode::Join { left, right, predicate, outer } => LogicalNode::Join {
                left: wrap(left),
                right: wrap(right),
                predicate,
                outer,
            },
            LogicalNode::Select { predicate, child } => LogicalNode::Select { predicate, child: wrap(child) },
            LogicalNode::GroupBy { columns, child } => LogicalNode::GroupBy { columns, child: wrap(child) },
            LogicalNode::Aggregation { aggregates, child } => LogicalNode::Aggregation { aggregates, child: wrap(child) },
            LogicalNode::OrderBy { terms, child } => LogicalNode::OrderBy { terms, child: wrap(child) },
            LogicalNode::Skip { count, child } => LogicalNode::Skip { count, child: wrap(child) },
            LogicalNode::Limit { count, child } => LogicalNode::Limit { count, child: wrap(child) },
            LogicalNode::Project { columns, child } => LogicalNode::Project { columns, child: wrap(child) },
            LogicalNode::Update { table, set, child } => LogicalNode::Update { table, set, child: wrap(child) },
            LogicalNode::Delete { table, child } => LogicalNode::Delete { table, child: wrap(child) },
        }
    }

    /// Applies `f` to every node, children first.
    pub fn transform_up(self, f: &mut impl FnMut(LogicalNode) -> LogicalNode) -> LogicalNode {
        let node = self.map_children(&mut |c| c.transform_up(f));
        f(node)
    }

    fn children(&self) -> Vec<&LogicalNode> {
        match self {
            LogicalNode::TableAccess { .. } | LogicalNode::Insert { .. } => Vec::new(),
            LogicalNode::CrossProduct { children } => children.iter().collect(),
            LogicalNode::Join { left, right, .. } => vec![left, right],
            LogicalNode::Select { child, .. }
            | LogicalNode::GroupBy { child, .. }
            | LogicalNode::Aggregation { child, .. }
            | LogicalNode::OrderBy { child, .. }
            | LogicalNode::Skip { child, .. }
            | LogicalNode::Limit { child, .. }
            | LogicalNode::Project { child, .. }
            | LogicalNode::Update { child, .. }
            | LogicalNode::Delete { child, .. } => vec![child],
        }
    }

    fn label(&self) -> String {
        match self {
            LogicalNode::TableAccess { table } => format!("table_access({})", table),
            LogicalNode::CrossProduct { .. } => "cross_product".to_string(),
            LogicalNode::Join { predicate, outer, .. } => {
                format!("join(type: {}, {} = {})", if *outer { "outer" } else { "inner" }, predicate.left, predicate.right)
            }
            LogicalNode::Select { predicate, .. } => format!("select({})", predicate),
            LogicalNode::GroupBy { columns, .. } => format!("group_by({})", join_display(columns)),
            LogicalNode::Aggregation { aggregates, .. } => {
                let names: Vec<String> = aggregates.iter().map(Aggregate::name).collect();
                format!("aggregation({})", names.join(", "))
            }
            LogicalNode::OrderBy { terms, .. } => format!("order_by({})", render_terms(terms)),
            LogicalNode::Skip { count, .. } => format!("skip({})", count),
            LogicalNode::Limit { count, .. } => format!("limit({})", count),
            LogicalNode::Project { columns, .. } => format!("project({})", render_projections(columns)),
            LogicalNode::Insert { table, replace, .. } => {
                format!("{}({})", if *replace { "insert_replace" } else { "insert" }, table)
            }
            LogicalNode::Update { table, .. } => format!("update({})", table),
            LogicalNode::Delete { table, .. } => format!("delete({})", table),
        }
    }

    fn render(&self, depth: usize, out: &mut String) {
        out.push_str(&"-".repeat(depth));
        out.push_str(&self.label());
        out.push('\n');
        for child in self.children() {
            child.render(depth + 1, out);
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

pub(crate) fn render_projections(columns: &[Projection]) -> String {
    if columns.is_empty() {
        return "*".to_string();
    }
    columns.iter().map(|p| p.output_name(false)).collect::<Vec<_>>().join(", ")
}

pub(crate) fn render_terms(terms: &[OrderTerm]) -> String {
    terms
        .iter()
        .map(|t| format!("{} {:?}", t.projection.output_name(false), t.order))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for LogicalNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        self.render(0, &mut out);
        f.write_str(&out)
    }
}
