pub mod cache;
pub mod state;
pub mod store;
pub mod memory;
pub mod layout;
pub mod wal;
pub mod checkpoint;
pub mod file_lock;
pub mod log_store;
