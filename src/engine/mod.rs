//! Job worker: queue polling, workflow locking, job retirement.

pub mod handlers;
pub mod worker;

pub use handlers::{HandlerRegistry, WorkflowHandler};
pub use worker::{Worker, WorkerConfig};
