//! # studio-ops
//!
//! Operations core for a production studio.
//!
//! Provides template-driven folder provisioning, contract-driven storage-root
//! integrity checks with quarantine planning, a durable job queue with
//! duplicate guarding and stale recovery, and per-resource workflow locks.
//! Postgres backs the queue, the locks and the contracts in production;
//! in-memory implementations back tests and local runs.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fs;
pub mod integrity;
pub mod lock;
pub mod model;
pub mod provisioning;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Result};
