use crate::plan::optimize::{PhysicalRule, PlanEnv};
use crate::plan::physical::PhysicalNode;

/// `COUNT(*)` over an unfiltered table reads the row count instead of the rows.
pub struct GetRowCountRule;

impl PhysicalRule for GetRowCountRule {
    fn name(&self) -> &str {
        "get_row_count"
    }

    fn optimize(&self, root: PhysicalNode, _env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::Aggregation { mut aggregates, child }
                if aggregates.len() == 1
                    && aggregates[0].is_count_star()
                    && matches!(*child, PhysicalNode::TableAccessFull { .. }) =>
            {
                match (*child, aggregates.pop()) {
                    (PhysicalNode::TableAccessFull { table }, Some(aggregate)) => {
                        PhysicalNode::GetRowCount { table, aggregate }
                    }
                    (child, popped) => PhysicalNode::Aggregation {
                        aggregates: popped.into_iter().collect(),
                        child: Box::new(child),
                    },
                }
            }
            other => other,
        })
    }
}
