// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! What to do with jobs whose executing instance stopped heartbeating.

use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::job::AsyncJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanAction {
    /// Complete as failed with the orphaned result code.
    Fail,
    /// Put back to queued and schedule a fresh attempt.
    Requeue,
    /// Keep as is for an operator to decide.
    Leave,
}

pub trait OrphanPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, job: &AsyncJob) -> OrphanAction;
}

pub struct FailOrphans;

impl OrphanPolicy for FailOrphans {
    fn name(&self) -> &str {
        "fail"
    }

    fn decide(&self, _job: &AsyncJob) -> OrphanAction {
        OrphanAction::Fail
    }
}

/// Requeues every orphan. Only safe when all dispatchers tolerate running
/// a command twice.
pub struct RequeueOrphans;

impl OrphanPolicy for RequeueOrphans {
    fn name(&self) -> &str {
        "requeue"
    }

    fn decide(&self, _job: &AsyncJob) -> OrphanAction {
        OrphanAction::Requeue
    }
}

pub struct LeaveOrphans;

impl OrphanPolicy for LeaveOrphans {
    fn name(&self) -> &str {
        "leave"
    }

    fn decide(&self, _job: &AsyncJob) -> OrphanAction {
        OrphanAction::Leave
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OrphanPolicyKind {
    #[default]
    /// Fail orphaned jobs
    Fail,
    /// Run orphaned jobs again
    Requeue,
    /// Leave orphaned jobs for operator intervention
    Leave,
}

impl OrphanPolicyKind {
    pub fn policy(&self) -> Arc<dyn OrphanPolicy> {
        match self {
            OrphanPolicyKind::Fail => Arc::new(FailOrphans),
            OrphanPolicyKind::Requeue => Arc::new(RequeueOrphans),
            OrphanPolicyKind::Leave => Arc::new(LeaveOrphans),
        }
    }
}
