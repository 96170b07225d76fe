// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::JobId;
use crate::msid::Msid;
use crate::sync_queue::SyncObject;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// The durable record of one unit of work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AsyncJob {
    pub id: JobId,
    pub job_type: Option<String>,
    /// Name of the registered dispatcher that interprets `cmd_info`.
    pub dispatcher: String,
    pub account_id: u64,
    pub user_id: u64,
    pub cmd: String,
    pub cmd_info: String,
    pub cmd_version: u32,

    pub status: JobStatus,
    /// Fine-grained progress, independent of `status`.
    pub process_status: i32,
    pub result_code: i32,
    pub result: Option<String>,

    pub created: OffsetDateTime,
    pub last_updated: Option<OffsetDateTime>,
    pub last_polled: Option<OffsetDateTime>,

    pub init_msid: Option<Msid>,
    /// Set only while a live instance owns the job.
    pub executing_msid: Option<Msid>,
    pub complete_msid: Option<Msid>,

    pub sync_object: Option<SyncObject>,
    pub sync_item_id: Option<u64>,
    pub related: Option<JobId>,
    pub instance_type: Option<String>,
    pub instance_id: Option<u64>,

    pub pseudo: bool,
    /// Parked on an asynchronous join until a wakeup re-dispatches it.
    pub suspended: bool,
    /// Optimistic concurrency version, bumped by the store on every write.
    pub version: u64,
}

impl AsyncJob {
    pub fn new(
        dispatcher: impl Into<String>,
        cmd: impl Into<String>,
        cmd_info: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            job_type: None,
            dispatcher: dispatcher.into(),
            account_id: 0,
            user_id: 0,
            cmd: cmd.into(),
            cmd_info: cmd_info.into(),
            cmd_version: 0,
            status: JobStatus::Queued,
            process_status: 0,
            result_code: 0,
            result: None,
            created: OffsetDateTime::now_utc(),
            last_updated: None,
            last_polled: None,
            init_msid: None,
            executing_msid: None,
            complete_msid: None,
            sync_object: None,
            sync_item_id: None,
            related: None,
            instance_type: None,
            instance_id: None,
            pseudo: false,
            suspended: false,
            version: 0,
        }
    }

    /// Build a job whose `cmd_info` is the JSON form of `payload`.
    pub fn for_command<T: Serialize>(
        dispatcher: impl Into<String>,
        cmd: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(dispatcher, cmd, serde_json::to_string(payload)?))
    }

    pub fn with_owner(mut self, account_id: u64, user_id: u64) -> Self {
        self.account_id = account_id;
        self.user_id = user_id;
        self
    }

    pub fn with_instance(mut self, instance_type: impl Into<String>, instance_id: u64) -> Self {
        self.instance_type = Some(instance_type.into());
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn related_to(mut self, job_id: JobId) -> Self {
        self.related = Some(job_id);
        self
    }

    pub fn command<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.cmd_info)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result_value(&self) -> Option<Value> {
        self.result
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn command_payload_is_recoverable() {
        let job = AsyncJob::for_command("vm-work", "start-vm", &serde_json::json!({"vm": 42}))
            .unwrap()
            .with_owner(2, 3)
            .with_instance("VirtualMachine", 42);
        let payload: Value = job.command().unwrap();
        assert_eq!(payload["vm"], 42);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.instance_type.as_deref(), Some("VirtualMachine"));
    }
}
