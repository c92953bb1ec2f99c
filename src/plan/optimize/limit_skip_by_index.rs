use crate::plan::optimize::{PhysicalRule, PlanEnv};
use crate::plan::physical::{PhysicalNode, RowIdSource};

/// Folds a limit and/or skip sitting directly on an index scan into the
/// scan itself.
pub struct LimitSkipByIndexRule;

impl PhysicalRule for LimitSkipByIndexRule {
    fn name(&self) -> &str {
        "limit_skip_by_index"
    }

    fn optimize(&self, root: PhysicalNode, _env: &PlanEnv) -> PhysicalNode {
        root.transform_down(&mut |node| match node {
            PhysicalNode::Limit { count, child } => match *child {
                PhysicalNode::Skip { count: skip, child } => match push(*child, Some(count), Some(skip)) {
                    Ok(access) => access,
                    Err(inner) => PhysicalNode::Limit {
                        count,
                        child: Box::new(PhysicalNode::Skip {
                            count: skip,
                            child: Box::new(inner),
                        }),
                    },
                },
                other => match push(other, Some(count), None) {
                    Ok(access) => access,
                    Err(inner) => PhysicalNode::Limit {
                        count,
                        child: Box::new(inner),
                    },
                },
            },
            PhysicalNode::Skip { count, child } => match push(*child, None, Some(count)) {
                Ok(access) => access,
                Err(inner) => PhysicalNode::Skip {
                    count,
                    child: Box::new(inner),
                },
            },
            other => other,
        })
    }
}

fn push(node: PhysicalNode, limit: Option<usize>, skip: Option<usize>) -> Result<PhysicalNode, PhysicalNode> {
    match node {
        PhysicalNode::TableAccessByRowId {
            table,
            source: RowIdSource::Index(mut scan),
        } if scan.limit.is_none() && scan.skip.is_none() => {
            scan.limit = limit;
            scan.skip = skip;
            Ok(PhysicalNode::TableAccessByRowId {
                table,
                source: RowIdSource::Index(scan),
            })
        }
        other => Err(other),
    }
}
