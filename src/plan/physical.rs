use std::collections::BTreeSet;
use std::fmt;
use crate::core::types::{Row, Value};
use crate::index::key_range::KeyRange;
use crate::plan::logical::{render_projections, render_terms};
use crate::query::builder::OrderTerm;
use crate::query::context::QueryContext;
use crate::query::predicate::{JoinPredicate, Predicate};
use crate::query::relation::{Aggregate, ColumnRef, Projection};

/// One bounded walk over an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRangeScan {
    /// Normalized index name.
    pub index: String,
    /// `None` walks every key.
    pub ranges: Option<Vec<KeyRange>>,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl IndexRangeScan {
    pub fn new(index: String, ranges: Option<Vec<KeyRange>>) -> Self {
        IndexRangeScan {
            index,
            ranges,
            reverse: false,
            limit: None,
            skip: None,
        }
    }
}

impl fmt::Display for IndexRangeScan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, ", self.index)?;
        match &self.ranges {
            None => write!(f, "[all]")?,
            Some(ranges) => {
                let parts: Vec<String> = ranges
                    .iter()
                    .map(|r| r.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", "))
                    .map(|s| format!("[{}]", s))
                    .collect();
                write!(f, "{}", parts.join(", "))?;
            }
        }
        if self.reverse {
            write!(f, ", reverse")?;
        }
        if let Some(n) = self.limit {
            write!(f, ", limit:{}", n)?;
        }
        if let Some(n) = self.skip {
            write!(f, ", skip:{}", n)?;
        }
        Ok(())
    }
}

/// Where a row-id table access gets its ids from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIdSource {
    Index(IndexRangeScan),
    /// Ids of several scans, deduplicated, in first-seen order.
    Union(Vec<IndexRangeScan>),
}

#[derive(Debug, Clone)]
pub enum PhysicalNode {
    TableAccessFull {
        table: String,
    },
    TableAccessByRowId {
        table: String,
        source: RowIdSource,
    },
    /// `COUNT(*)` over a whole table, read off the row-id index.
    GetRowCount {
        table: String,
        aggregate: Aggregate,
    },
    Select {
        predicate: Predicate,
        child: Box<PhysicalNode>,
    },
    CrossProduct {
        children: Vec<PhysicalNode>,
    },
    Join {
        left: Box<PhysicalNode>,
        right: Box<PhysicalNode>,
        predicate: JoinPredicate,
        outer: bool,
    },
    /// Probes `index` on `table` once per entry of `driver`. The predicate's
    /// left column reads the driver, its right column is the indexed one.
    IndexJoin {
        driver: Box<PhysicalNode>,
        table: String,
        index: String,
        predicate: JoinPredicate,
        outer: bool,
    },
    GroupBy {
        columns: Vec<ColumnRef>,
        child: Box<PhysicalNode>,
    },
    Aggregation {
        aggregates: Vec<Aggregate>,
        child: Box<PhysicalNode>,
    },
    OrderBy {
        terms: Vec<OrderTerm>,
        child: Box<PhysicalNode>,
    },
    Skip {
        count: usize,
        child: Box<PhysicalNode>,
    },
    Limit {
        count: usize,
        child: Box<PhysicalNode>,
    },
    Project {
        columns: Vec<Projection>,
        child: Box<PhysicalNode>,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
        replace: bool,
    },
    Update {
        table: String,
        set: Vec<(String, Value)>,
        child: Box<PhysicalNode>,
    },
    Delete {
        table: String,
        child: Box<PhysicalNode>,
    },
}

impl PhysicalNode {
    pub fn select(predicate: Predicate, child: PhysicalNode) -> PhysicalNode {
        PhysicalNode::Select {
            predicate,
            child: Box::new(child),
        }
    }

    pub fn tables(&self) -> BTreeSet<String> {
        match self {
            PhysicalNode::TableAccessFull { table }
            | PhysicalNode::TableAccessByRowId { table, .. }
            | PhysicalNode::GetRowCount { table, .. }
            | PhysicalNode::Insert { table, .. } => BTreeSet::from([table.clone()]),
            PhysicalNode::CrossProduct { children } => children.iter().flat_map(|c| c.tables()).collect(),
            PhysicalNode::Join { left, right, .. } => {
                let mut t = left.tables();
                t.extend(right.tables());
                t
            }
            PhysicalNode::IndexJoin { driver, table, .. } => {
                let mut t = driver.tables();
                t.insert(table.clone());
                t
            }
            PhysicalNode::Select { child, .. }
            | PhysicalNode::GroupBy { child, .. }
            | PhysicalNode::Aggregation { child, .. }
            | PhysicalNode::OrderBy { child, .. }
            | PhysicalNode::Skip { child, .. }
            | PhysicalNode::Limit { child, .. }
            | PhysicalNode::Project { child, .. }
            | PhysicalNode::Update { child, .. }
            | PhysicalNode::Delete { child, .. } => child.tables(),
        }
    }

    /// Rebuilds this node with `f` applied to each direct child.
    pub fn map_children(self, f: &mut impl FnMut(PhysicalNode) -> PhysicalNode) -> PhysicalNode {
        let mut wrap = |c: Box<PhysicalNode>| Box::new(f(*c));
        match self {
            leaf @ (PhysicalNode::TableAccessFull { .. }
            | PhysicalNode::TableAccessByRowId { .. }
            | PhysicalNode::GetRowCount { .. }
            | PhysicalNode::Insert { .. }) => leaf,
            PhysicalNode::CrossProduct { children } => PhysicalNode::CrossProduct {
                children: children.into_iter().map(|c| *wrap(Box::new(c))).collect(),
            },
            PhysicalNode::Join { left, right, predicate, outer } => PhysicalNode::Join {
                left: wrap(left),
                right: wrap(right),
                predicate,
                outer,
            },
            PhysicalNode::IndexJoin {
                driver,
                table,
                index,
                predicate,
                outer,
            } => PhysicalNode::IndexJoin {
                driver: wrap(driver),
                table,
                index,
                predicate,
                outer,
            },
            PhysicalNode::Select { predicate, child } => PhysicalNode::Select { predicate, child: wrap(child) },
            PhysicalNode::GroupBy { columns, child } => PhysicalNode::GroupBy { columns, child: wrap(child) },
            PhysicalNode::Aggregation { aggregates, child } => {
                PhysicalNode::Aggregation { aggregates, child: wrap(child) }
            }
            PhysicalNode::OrderBy { terms, child } => PhysicalNode::OrderBy { terms, child: wrap(child) },
            PhysicalNode::Skip { count, child } => PhysicalNode::Skip { count, child: wrap(child) },
            PhysicalNode::Limit { count, child } => PhysicalNode::Limit { count, child: wrap(child) },
            PhysicalNode::Project { columns, child } => PhysicalNode::Project { columns, child: wrap(child) },
            PhysicalNode::Update { table, set, child } => PhysicalNode::Update { table, set, child: wrap(child) },
            PhysicalNode::Delete { table, child } => PhysicalNode::Delete { table, child: wrap(child) },
        }
    }

    /// Applies `f` to every node, parents first. `f` sees each node before
    /// its (possibly rewritten) children are visited.
    pub fn transform_down(self, f: &mut impl FnMut(PhysicalNode) -> PhysicalNode) -> PhysicalNode {
        f(self).map_children(&mut |c| c.transform_down(f))
    }

    pub fn children(&self) -> Vec<&PhysicalNode> {
        match self {
            PhysicalNode::TableAccessFull { .. }
            | PhysicalNode::TableAccessByRowId { .. }
            | PhysicalNode::GetRowCount { .. }
            | PhysicalNode::Insert { .. } => Vec::new(),
            PhysicalNode::CrossProduct { children } => children.iter().collect(),
            PhysicalNode::Join { left, right, .. } => vec![left, right],
            PhysicalNode::IndexJoin { driver, .. } => vec![driver],
            PhysicalNode::Select { child, .. }
            | PhysicalNode::GroupBy { child, .. }
            | PhysicalNode::Aggregation { child, .. }
            | PhysicalNode::OrderBy { child, .. }
            | PhysicalNode::Skip { child, .. }
            | PhysicalNode::Limit { child, .. }
            | PhysicalNode::Project { child, .. }
            | PhysicalNode::Update { child, .. }
            | PhysicalNode::Delete { child, .. } => vec![child],
        }
    }

    fn label(&self) -> String {
        match self {
            PhysicalNode::TableAccessFull { table } => format!("table_access({})", table),
            PhysicalNode::TableAccessByRowId { table, source } => match source {
                RowIdSource::Index(scan) => {
                    format!("table_access_by_row_id({})\n  index_range_scan({})", table, scan)
                }
                RowIdSource::Union(scans) => {
                    let parts: Vec<String> = scans.iter().map(|s| format!("index_range_scan({})", s)).collect();
                    format!("table_access_by_row_id({})\n  multi_index_range_scan({})", table, parts.join(", "))
                }
            },
            PhysicalNode::GetRowCount { table, .. } => format!("get_row_count({})", table),
            PhysicalNode::Select { predicate, .. } => format!("select({})", predicate),
            PhysicalNode::CrossProduct { .. } => "cross_product".to_string(),
            PhysicalNode::Join { predicate, outer, .. } => format!(
                "hash_join(type: {}, {} = {})",
                if *outer { "outer" } else { "inner" },
                predicate.left,
                predicate.right
            ),
            PhysicalNode::IndexJoin {
                index, predicate, outer, ..
            } => format!(
                "index_join(type: {}, {} = {}, index: {})",
                if *outer { "outer" } else { "inner" },
                predicate.left,
                predicate.right,
                index
            ),
            PhysicalNode::GroupBy { columns, .. } => {
                let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                format!("group_by({})", cols.join(", "))
            }
            PhysicalNode::Aggregation { aggregates, .. } => {
                let names: Vec<String> = aggregates.iter().map(Aggregate::name).collect();
                format!("aggregation({})", names.join(", "))
            }
            PhysicalNode::OrderBy { terms, .. } => format!("order_by({})", render_terms(terms)),
            PhysicalNode::Skip { count, .. } => format!("skip({})", count),
            PhysicalNode::Limit { count, .. } => format!("limit({})", count),
            PhysicalNode::Project { columns, .. } => format!("project({})", render_projections(columns)),
            PhysicalNode::Insert { table, replace, .. } => {
                format!("{}({})", if *replace { "insert_replace" } else { "insert" }, table)
            }
            PhysicalNode::Update { table, .. } => format!("update({})", table),
            PhysicalNode::Delete { table, .. } => format!("delete({})", table),
        }
    }

    fn render(&self, depth: usize, out: &mut String) {
        let prefix = "-".repeat(depth);
        for (i, line) in self.label().lines().enumerate() {
            out.push_str(&prefix);
            if i > 0 {
                out.push('-');
                out.push_str(line.trim_start());
            } else {
                out.push_str(line);
            }
            out.push('\n');
        }
        for child in self.children() {
            child.render(depth + 1, out);
        }
    }
}

impl fmt::Display for PhysicalNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        self.render(0, &mut out);
        f.write_str(&out)
    }
}

/// Compiled query, ready for the executor.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    pub root: PhysicalNode,
    pub context: QueryContext,
}

impl PhysicalPlan {
    pub fn explain(&self) -> String {
        self.root.to_string()
    }
}
