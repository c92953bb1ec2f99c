pub mod builder;
pub mod context;
pub mod predicate;
pub mod relation;

pub use builder::{DeleteQuery, InsertQuery, JoinKind, OrderTerm, Query, SelectQuery, UpdateQuery};
pub use context::QueryContext;
pub use predicate::{and, not, or, param, Predicate};
pub use relation::{col, ColumnRef, Projection};
