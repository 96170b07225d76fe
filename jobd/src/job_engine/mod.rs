// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Bounded Worker Pools
//!
//! ## Overview
//! Every piece of asynchronous work in jobd runs on an [`Executor`]:
//!
//! - The job manager owns one executor for job runs and background loops.
//! - Every agent dispatch channel hands answer callbacks to a separate
//!   executor, so slow completion logic never runs on a transport thread.
//! - A job awaiting a join is a pending future, it holds no worker thread.
//! - `close()` stops intake and fires the shutdown signal, background loops
//!   exit at their next wakeup, `wait_until_finished()` blocks until the
//!   in-flight counter drops to zero.
//!
//! ```text
//!         +----------------+      +------------------+
//!         |  AsyncJobMgr   |      | DispatchChannel  |
//!         +-------+--------+      +---------+--------+
//!                 |                         |
//!                 v                         v
//!         +-------+--------+      +---------+--------+
//!         |  job executor  |      | callback executor|
//!         | (N workers)    |      | (M workers)      |
//!         +----------------+      +------------------+
//! ```

pub mod periodic;
pub mod timeout;
pub mod work_item;

pub use periodic::PeriodicLoop;
pub use timeout::{sleep, with_timeout, Elapsed};
pub use work_item::{Executor, ShutdownSignal, WorkItem};
