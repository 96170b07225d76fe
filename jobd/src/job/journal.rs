// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::JobId;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JournalType {
    Info,
    Success,
    Failure,
}

/// Audit trail entry, appended while a job is not yet terminal.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobJournal {
    pub id: u64,
    pub job_id: JobId,
    pub journal_type: JournalType,
    pub text: String,
    pub obj_json: Option<String>,
    pub created: OffsetDateTime,
}

impl JobJournal {
    pub fn new(
        job_id: JobId,
        journal_type: JournalType,
        text: impl Into<String>,
        obj_json: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            job_id,
            journal_type,
            text: text.into(),
            obj_json,
            created: OffsetDateTime::now_utc(),
        }
    }
}
