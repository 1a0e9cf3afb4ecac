pub mod action;
pub mod backup;
pub mod backup_state;
pub mod credentials;
pub mod cycle_log;
pub mod inflight;
pub mod settings;
