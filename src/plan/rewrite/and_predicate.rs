use crate::plan::logical::LogicalNode;
use crate::plan::rewrite::RewriteRule;
use crate::query::context::QueryContext;

/// Splits a select on a conjunction into a chain of selects, one per term.
/// The first term ends up outermost.
pub struct AndPredicateRule;

impl RewriteRule for AndPredicateRule {
    fn name(&self) -> &str {
        "and_predicate"
    }

    fn rewrite(&self, root: LogicalNode, _ctx: &QueryContext) -> LogicalNode {
        root.transform_up(&mut |node| match node {
            LogicalNode::Select { predicate, child } => predicate
                .into_conjuncts()
                .into_iter()
                .rev()
                .fold(*child, |acc, p| LogicalNode::select(p, acc)),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::SelectQuery;
    use crate::query::predicate::and;
    use crate::query::relation::col;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};
    use std::sync::Arc;

    #[test]
    fn test_nested_conjunction_becomes_chain() {
        let schema = SchemaBuilder::new("s", 1)
            .table(TableBuilder::new("t").add_column("x", DataType::Integer))
            .build()
            .unwrap();
        let q = SelectQuery::new(vec![]).from("t").into_query();
        let ctx = QueryContext::new(Arc::new(schema), &q);

        let p = and(vec![col("t", "x").gt(1), and(vec![col("t", "x").lt(9), col("t", "x").neq(5)])]);
        let tree = LogicalNode::select(p, LogicalNode::TableAccess { table: "t".into() });
        let out = AndPredicateRule.rewrite(tree, &ctx).to_string();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "select(t.x > 1)");
        assert_eq!(lines[1], "-select(t.x < 9)");
        assert_eq!(lines[2], "--select(t.x != 5)");
        assert_eq!(lines[3], "---table_access(t)");
    }
}
