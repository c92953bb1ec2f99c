pub mod cost;
pub mod executor;
pub mod factory;
pub mod generator;
pub mod logical;
pub mod optimize;
pub mod physical;
pub mod rewrite;

use std::sync::Arc;
use tracing::debug;
use crate::core::error::Result;
use crate::plan::logical::LogicalNode;
use crate::plan::optimize::{PhysicalRule, PlanEnv};
use crate::plan::physical::PhysicalPlan;
use crate::plan::rewrite::RewriteRule;
use crate::query::builder::Query;
use crate::query::context::{validate, QueryContext};
use crate::schema::schema::Schema;
use crate::storage::state::InMemoryState;

/// Compiles queries into physical plans: generate, rewrite, lower, optimize.
pub struct QueryEngine {
    rewrites: Vec<Box<dyn RewriteRule>>,
    optimizations: Vec<Box<dyn PhysicalRule>>,
}

impl QueryEngine {
    pub fn new() -> Self {
        QueryEngine {
            rewrites: rewrite::default_rules(),
            optimizations: optimize::default_rules(),
        }
    }

    fn prepare(&self, schema: &Arc<Schema>, query: &Query) -> Result<(QueryContext, LogicalNode)> {
        validate(schema, query)?;
        let ctx = QueryContext::new(Arc::clone(schema), query);
        let logical = generator::generate(query)?;
        Ok((ctx, logical))
    }

    pub fn compile(&self, query: &Query, state: &InMemoryState) -> Result<PhysicalPlan> {
        let (ctx, mut logical) = self.prepare(&state.schema, query)?;
        for rule in &self.rewrites {
            logical = rule.rewrite(logical, &ctx);
        }

        let mut root = factory::lower(logical);
        let env = PlanEnv { ctx: &ctx, state };
        for rule in &self.optimizations {
            root = rule.optimize(root, &env);
            debug!(rule = rule.name(), "applied physical rule");
        }
        Ok(PhysicalPlan { root, context: ctx })
    }

    /// The generated plan lowered as is, without rewrites or index use.
    pub fn compile_unoptimized(&self, query: &Query, state: &InMemoryState) -> Result<PhysicalPlan> {
        let (ctx, logical) = self.prepare(&state.schema, query)?;
        Ok(PhysicalPlan {
            root: factory::lower(logical),
            context: ctx,
        })
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}
