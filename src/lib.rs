//! parcel-engine: application layer over `parcel_core`.
//!
//! Loads configuration, initialises tracing and wires the analyzer to either
//! a YAML fixture or the Postgres adapters (feature `database`).

pub mod backend;
pub mod config;
pub mod telemetry;

pub use backend::Backend;
pub use config::{AppConfig, ContextCacheBackend};
