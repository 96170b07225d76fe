// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::HostId;
use crate::job::{result_code, JobId, JobStatus};
use crate::sync_queue::SyncObject;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by the persistence collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency check failed, somebody else wrote first.
    #[error("stale write to {entity} {id}: expected version {expected}")]
    VersionMismatch {
        entity: &'static str,
        id: u64,
        expected: u64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("{entity} {id} already finished")]
    Terminal { entity: &'static str, id: u64 },

    #[error("duplicate {entity}: {detail}")]
    Duplicate {
        entity: &'static str,
        detail: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Transport-level failures of the agent dispatch layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("host {host} unavailable: {reason}")]
    Unavailable { host: HostId, reason: String },

    #[error("operation on host {host} timed out after {timeout:?}")]
    OperationTimedOut { host: HostId, timeout: Duration },

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("async job intake is disabled")]
    JobsDisabled,

    #[error("sync queue for {sync_object} is full (limit {limit})")]
    QueueFull {
        sync_object: SyncObject,
        limit: usize,
    },

    #[error("job-{0} not found")]
    JobNotFound(JobId),

    #[error("job-{job_id}: cannot {operation} while {status:?}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("no dispatcher registered as '{0}'")]
    NoSuchDispatcher(String),

    #[error("job-{parent} already joins job-{child}")]
    DuplicateJoin { parent: JobId, child: JobId },

    #[error("job-{parent} does not join job-{child}")]
    JoinNotFound { parent: JobId, child: JobId },

    #[error("join of job-{parent} on job-{child} timed out")]
    JoinTimedOut { parent: JobId, child: JobId },

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("concurrent operation in progress: {0}")]
    ConcurrentOperation(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A joined job failed with an exception kind this process does not know.
    #[error("joined job failed with {kind}: {message}")]
    Remote { kind: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker pool: {0}")]
    Io(#[from] std::io::Error),
}

pub mod exception_kind {
    pub const INSUFFICIENT_CAPACITY: &str = "insufficient-capacity";
    pub const CONCURRENT_OPERATION: &str = "concurrent-operation";
    pub const RESOURCE_UNAVAILABLE: &str = "resource-unavailable";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERNAL: &str = "internal";
}

/// Failure of a dispatcher, persisted as a failed job's result so that
/// joining jobs can rebuild the original error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct JobException {
    pub kind: String,
    pub message: String,
}

impl JobException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn insufficient_capacity(message: impl Into<String>) -> Self {
        Self::new(exception_kind::INSUFFICIENT_CAPACITY, message)
    }

    pub fn concurrent_operation(message: impl Into<String>) -> Self {
        Self::new(exception_kind::CONCURRENT_OPERATION, message)
    }

    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(exception_kind::RESOURCE_UNAVAILABLE, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(exception_kind::CANCELLED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(exception_kind::INTERNAL, message)
    }

    pub fn result_code(&self) -> i32 {
        match self.kind.as_str() {
            exception_kind::INSUFFICIENT_CAPACITY => result_code::INSUFFICIENT_CAPACITY,
            exception_kind::CONCURRENT_OPERATION => result_code::CONCURRENT_OPERATION,
            exception_kind::RESOURCE_UNAVAILABLE => result_code::RESOURCE_UNAVAILABLE,
            exception_kind::CANCELLED => result_code::CANCELLED,
            _ => result_code::INTERNAL_ERROR,
        }
    }

    /// Parse a failed job's stored result. None if it is not an exception.
    pub fn from_result(result: &str) -> Option<Self> {
        serde_json::from_str(result).ok()
    }

    pub fn into_job_error(self) -> JobError {
        match self.kind.as_str() {
            exception_kind::INSUFFICIENT_CAPACITY => JobError::InsufficientCapacity(self.message),
            exception_kind::CONCURRENT_OPERATION => JobError::ConcurrentOperation(self.message),
            exception_kind::RESOURCE_UNAVAILABLE => JobError::ResourceUnavailable(self.message),
            _ => JobError::Remote {
                kind: self.kind,
                message: self.message,
            },
        }
    }
}

impl From<JobError> for JobException {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InsufficientCapacity(m) => JobException::insufficient_capacity(m),
            JobError::ConcurrentOperation(m) => JobException::concurrent_operation(m),
            JobError::ResourceUnavailable(m) => JobException::resource_unavailable(m),
            JobError::Remote { kind, message } => JobException::new(kind, message),
            JobError::Agent(e @ AgentError::Unavailable { .. }) => {
                JobException::resource_unavailable(e.to_string())
            }
            other => JobException::internal(other.to_string()),
        }
    }
}

impl From<AgentError> for JobException {
    fn from(err: AgentError) -> Self {
        JobError::Agent(err).into()
    }
}
