pub mod key;
pub mod key_range;
pub mod comparator;
pub mod runtime;
pub mod btree;
pub mod nullable;
pub mod row_id;
pub mod index_store;
