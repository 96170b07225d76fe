// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Persistent records of the job subsystem: the job itself, join edges
//! between jobs and the free-text journal.

pub mod join_map;
pub mod journal;
pub mod record;

pub use join_map::{AsyncJobJoinMap, WakeupSpec};
pub use journal::{JobJournal, JournalType};
pub use record::{AsyncJob, JobStatus};

pub type JobId = u64;

pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL_ERROR: i32 = 530;
    pub const RESOURCE_UNAVAILABLE: i32 = 533;
    pub const INSUFFICIENT_CAPACITY: i32 = 534;
    pub const CONCURRENT_OPERATION: i32 = 537;
    pub const CANCELLED: i32 = 538;
    pub const ORPHANED: i32 = 539;
    pub const QUEUE_REJECTED: i32 = 540;
}
