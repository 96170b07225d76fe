// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Asynchronous job execution and cross-host command dispatch.
//!
//! Jobs are durable records executed by named dispatchers on a worker pool.
//! Jobs touching the same object are serialized through sync queues, jobs
//! can wait for each other through joins, and commands reach execution
//! agents through endpoints.

pub mod agent;
pub mod endpoint;
pub mod error;
pub mod global_config;
pub mod job;
pub mod job_engine;
pub mod manager;
pub mod message_bus;
pub mod msid;
pub mod store;
pub mod sync_queue;

pub use error::{AgentError, JobError, JobException, StoreError};
pub use job::{AsyncJob, JobId, JobStatus};
pub use manager::{AsyncJobExecutionContext, AsyncJobManager, JobDispatcher, JobOutcome};
pub use msid::Msid;
