//! Physical plan rules. They run in order over the lowered tree and may
//! consult index statistics through the committed state.

mod get_row_count;
mod index_join;
mod index_range_scan;
mod limit_skip_by_index;
mod multi_column_or;
mod order_by_index;

pub use get_row_count::GetRowCountRule;
pub use index_join::IndexJoinRule;
pub use index_range_scan::IndexRangeScanRule;
pub use limit_skip_by_index::LimitSkipByIndexRule;
pub use multi_column_or::MultiColumnOrRule;
pub use order_by_index::OrderByIndexRule;

use crate::plan::physical::PhysicalNode;
use crate::query::context::QueryContext;
use crate::query::predicate::Predicate;
use crate::storage::state::InMemoryState;

pub struct PlanEnv<'a> {
    pub ctx: &'a QueryContext,
    pub state: &'a InMemoryState,
}

pub trait PhysicalRule: Send + Sync {
    fn name(&self) -> &str;
    fn optimize(&self, root: PhysicalNode, env: &PlanEnv) -> PhysicalNode;
}

pub fn default_rules() -> Vec<Box<dyn PhysicalRule>> {
    vec![
        Box::new(IndexJoinRule),
        Box::new(IndexRangeScanRule),
        Box::new(MultiColumnOrRule),
        Box::new(OrderByIndexRule),
        Box::new(LimitSkipByIndexRule),
        Box::new(GetRowCountRule),
    ]
}

/// Peels a chain of selects off `node`. Predicates come back outermost first.
pub(crate) fn unwrap_selects(mut node: PhysicalNode) -> (Vec<Predicate>, PhysicalNode) {
    let mut predicates = Vec::new();
    while let PhysicalNode::Select { predicate, child } = node {
        predicates.push(predicate);
        node = *child;
    }
    (predicates, node)
}

/// Inverse of `unwrap_selects`.
pub(crate) fn wrap_selects(predicates: Vec<Predicate>, base: PhysicalNode) -> PhysicalNode {
    predicates
        .into_iter()
        .rev()
        .fold(base, |acc, p| PhysicalNode::select(p, acc))
}
