//! Utility modules for the bridge server.

pub mod logger;
