use crate::plan::logical::LogicalNode;
use crate::plan::rewrite::RewriteRule;
use crate::query::context::QueryContext;
use crate::query::predicate::Predicate;

/// Replaces a join predicate selected directly over a binary cross product
/// with a join node, when each side of the product feeds one column.
pub struct ImplicitJoinsRule;

impl RewriteRule for ImplicitJoinsRule {
    fn name(&self) -> &str {
        "implicit_joins"
    }

    fn rewrite(&self, root: LogicalNode, ctx: &QueryContext) -> LogicalNode {
        root.transform_up(&mut |node| match node {
            LogicalNode::Select {
                predicate: Predicate::Join(join),
                child,
            } => match *child {
                LogicalNode::CrossProduct { children } if children.len() == 2 => {
                    let left_tables = children[0].tables();
                    let right_tables = children[1].tables();
                    let oriented = join.oriented(&left_tables);
                    let splits =
                        left_tables.contains(&oriented.left.table) && right_tables.contains(&oriented.right.table);
                    match <[LogicalNode; 2]>::try_from(children) {
                        Ok([left, right]) if splits => LogicalNode::Join {
                            left: Box::new(left),
                            right: Box::new(right),
                            outer: ctx.outer_joins.contains_key(&oriented.id),
                            predicate: oriented,
                        },
                        Ok(pair) => LogicalNode::select(
                            Predicate::Join(join),
                            LogicalNode::CrossProduct { children: pair.into() },
                        ),
                        Err(children) => {
                            LogicalNode::select(Predicate::Join(join), LogicalNode::CrossProduct { children })
                        }
                    }
                }
                other => LogicalNode::select(Predicate::Join(join), other),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::generator::generate;
    use crate::plan::rewrite::default_rules;
    use crate::query::builder::{Query, SelectQuery};
    use crate::query::relation::col;
    use crate::schema::schema::{DataType, SchemaBuilder, TableBuilder};
    use std::sync::Arc;

    fn rewrite_all(q: &Query) -> String {
        let mut sb = SchemaBuilder::new("s", 1);
        for t in ["a", "b", "c"] {
            sb = sb.table(TableBuilder::new(t).add_column("id", DataType::Integer));
        }
        let ctx = QueryContext::new(Arc::new(sb.build().unwrap()), q);
        default_rules()
            .iter()
            .fold(generate(q).unwrap(), |tree, rule| rule.rewrite(tree, &ctx))
            .to_string()
    }

    #[test]
    fn test_three_table_join_becomes_join_chain() {
        let q = SelectQuery::new(vec![])
            .from("a")
            .inner_join("b", col("b", "id").eq_col(col("a", "id")))
            .inner_join("c", col("c", "id").eq_col(col("b", "id")))
            .into_query();
        let plan = rewrite_all(&q);
        assert!(!plan.contains("cross_product"), "{}", plan);
        let lines: Vec<&str> = plan.lines().collect();
        assert_eq!(lines[1], "-join(type: inner, b.id = c.id)");
        assert_eq!(lines[2], "--join(type: inner, a.id = b.id)");
        assert_eq!(lines[3], "---table_access(a)");
        assert_eq!(lines[4], "---table_access(b)");
        assert_eq!(lines[5], "--table_access(c)");
    }

    #[test]
    fn test_non_join_select_left_alone() {
        let q = SelectQuery::new(vec![])
            .from("a")
            .from("b")
            .where_(col("a", "id").lt_col(col("a", "id")))
            .into_query();
        let plan = rewrite_all(&q);
        assert!(plan.contains("cross_product"), "{}", plan);
    }
}
