//! Gatehouse Delayed Jobs
//!
//! Schedules "publish this later" jobs through a relational store. Producers
//! insert rows keyed by `due_time`; per-topic executors poll every second,
//! claim each due job with a racing `DELETE`, publish it into the log (with
//! hinted-handoff fallback), and archive it to a history table.
//!
//! Delivery is at-least-once: a job either fires (history row) or stays in
//! the due table; it is never silently lost. Order across the handler pool
//! is not preserved - see `ExecutorConfig::handler_concurrency`.

pub mod error;
pub mod executor;
pub mod store;

pub use error::{JobError, Result};
pub use executor::{ExecutorConfig, JobExecutor};
pub use store::{
    history_table, job_table, next_job_id, DummyJobStore, JobItem, JobStore, SqliteJobStore,
};
