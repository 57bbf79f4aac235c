//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod file_kv;
pub mod http_provider;
pub mod telemetry;
