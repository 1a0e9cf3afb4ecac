//! Snapshot bridge library.
//!
//! Keeps a cloud drive populated with copies of the local snapshots and
//! enforces retention on both ends.

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod ws;

pub use config::{AppConfig, EngineSettings};
pub use error::{AdapterError, AppError, CycleError};
