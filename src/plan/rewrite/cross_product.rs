use crate::plan::logical::LogicalNode;
use crate::plan::rewrite::RewriteRule;
use crate::query::context::QueryContext;

/// Turns an n-ary cross product into a left-deep chain of binary ones.
pub struct CrossProductRule;

impl RewriteRule for CrossProductRule {
    fn name(&self) -> &str {
        "cross_product"
    }

    fn rewrite(&self, root: LogicalNode, _ctx: &QueryContext) -> LogicalNode {
        root.transform_up(&mut |node| match node {
            LogicalNode::CrossProduct { children } if children.len() > 2 => {
                let mut iter = children.into_iter();
                let mut acc = match iter.next() {
                    Some(first) => first,
                    None => return LogicalNode::CrossProduct { children: Vec::new() },
                };
                for child in iter {
                    acc = LogicalNode::CrossProduct {
                        children: vec![acc, child],
                    };
                }
                acc
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::SelectQuery;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};
    use std::sync::Arc;

    #[test]
    fn test_three_way_product_is_left_deep() {
        let mut sb = SchemaBuilder::new("s", 1);
        for t in ["a", "b", "c"] {
            sb = sb.table(TableBuilder::new(t).add_column("id", DataType::Integer));
        }
        let q = SelectQuery::new(vec![]).from("a").into_query();
        let ctx = QueryContext::new(Arc::new(sb.build().unwrap()), &q);

        let tree = LogicalNode::CrossProduct {
            children: ["a", "b", "c"]
                .iter()
                .map(|t| LogicalNode::TableAccess { table: t.to_string() })
                .collect(),
        };
        let out = CrossProductRule.rewrite(tree, &ctx).to_string();
        assert_eq!(
            out,
            "cross_product\n-cross_product\n--table_access(a)\n--table_access(b)\n-table_access(c)\n"
        );
    }
}
