//! Infrastructure - configuration, time, storage, metrics and supervision
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `clock` - Injectable time source
//! - `db` - Shared SQLite handle
//! - `store` - Duration ledger and session state
//! - `metrics` - Lock-free metrics collection
//! - `supervisor` - Liveness watchdog for the pipeline stages

pub mod clock;
pub mod config;
pub mod db;
pub mod metrics;
pub mod store;
pub mod supervisor;

// Re-export commonly used types
pub use clock::{Clock, MockClock, SystemClock};
pub use config::Config;
pub use db::{Db, StoreError};
pub use metrics::Metrics;
pub use store::DurationStore;
pub use supervisor::{Liveness, Supervisor, SupervisorError};
