//! I/O adapters for the controller: storage, hardware, logs, and metrics.

pub mod config;
pub mod init;
pub mod lock;
pub mod metrics;
pub mod oplog;
pub mod pacer;
pub mod state;
pub mod store;
pub mod valve;
