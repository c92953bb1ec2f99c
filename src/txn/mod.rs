pub mod diff;
pub mod constraint;
pub mod journal;
pub mod lock;
pub mod runner;
pub mod task;
