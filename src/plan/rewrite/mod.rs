//! Logical rewrites. Each pass takes ownership of the tree and returns the
//! rewritten one; passes run in a fixed order.

mod and_predicate;
mod cross_product;
mod implicit_joins;
mod push_down;

pub use and_predicate::AndPredicateRule;
pub use cross_product::CrossProductRule;
pub use implicit_joins::ImplicitJoinsRule;
pub use push_down::PushDownSelectionsRule;

use crate::plan::logical::LogicalNode;
use crate::query::context::QueryContext;

pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &str;
    fn rewrite(&self, root: LogicalNode, ctx: &QueryContext) -> LogicalNode;
}

pub fn default_rules() -> Vec<Box<dyn RewriteRule>> {
    vec![
        Box::new(AndPredicateRule),
        Box::new(CrossProductRule),
        Box::new(PushDownSelectionsRule),
        Box::new(ImplicitJoinsRule),
    ]
}
