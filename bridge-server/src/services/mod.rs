pub mod backoff;
pub mod catalog;
pub mod cycle;
pub mod executor;
pub mod linker;
pub mod planner;
pub mod recovery;
pub mod retention;
pub mod sync_scheduler;
