//! Bulk email/SMS dispatch engine.
//!
//! Jobs are resolved to recipients, queued per channel and advanced one at a
//! time by a periodic scheduler. Each job is split into batches that are sent
//! with bounded concurrency; job-level failures are retried after a fixed
//! delay. `BulkDispatcher` is the entry point.

pub mod batch;
pub mod channel;
pub mod cleanup;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod stats;
pub mod store;
pub mod template;

pub use dispatcher::BulkDispatcher;
pub use error::NotifierError;
pub use events::{JobEvent, JobObserver};
