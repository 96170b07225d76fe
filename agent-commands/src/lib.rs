// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Wire types exchanged between the orchestrator and its execution agents.
//!
//! A [`Command`] describes exactly one agent-side operation. Every send of a
//! command yields exactly one [`Answer`], either produced by the agent or
//! substituted by the dispatch layer when the agent could not be reached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "command")]
pub enum CommandBody {
    #[serde(rename = "create-storage-pool")]
    CreateStoragePool {
        pool_uuid: String,
        pool_type: String,
        host_path: String,
    },

    #[serde(rename = "delete-storage-pool")]
    DeleteStoragePool { pool_uuid: String },

    #[serde(rename = "handle-config-drive-iso")]
    HandleConfigDriveIso {
        iso_path: String,
        create: bool,
        iso_data: Option<String>,
    },

    #[serde(rename = "copy-volume")]
    CopyVolume {
        src_path: String,
        dest_pool_uuid: String,
    },

    #[serde(rename = "attach-volume")]
    AttachVolume { vm_name: String, volume_path: String },

    #[serde(rename = "setup-network")]
    SetupNetwork {
        network_id: u64,
        vlan: Option<u16>,
    },

    #[serde(rename = "ready")]
    Ready { host_id: u64 },

    /// Anything the core does not need to understand.
    #[serde(rename = "custom")]
    Custom { name: String, payload: Value },
}

impl CommandBody {
    pub fn name(&self) -> &str {
        match self {
            CommandBody::CreateStoragePool { .. } => "create-storage-pool",
            CommandBody::DeleteStoragePool { .. } => "delete-storage-pool",
            CommandBody::HandleConfigDriveIso { .. } => "handle-config-drive-iso",
            CommandBody::CopyVolume { .. } => "copy-volume",
            CommandBody::AttachVolume { .. } => "attach-volume",
            CommandBody::SetupNetwork { .. } => "setup-network",
            CommandBody::Ready { .. } => "ready",
            CommandBody::Custom { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Command {
    #[serde(flatten)]
    pub body: CommandBody,

    /// Wait hint in seconds. 0 means "use the channel default".
    #[serde(default)]
    pub wait: u32,

    /// Safe to resend after the agent was unreachable.
    #[serde(default)]
    pub idempotent: bool,

    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            body,
            wait: 0,
            idempotent: false,
            context: BTreeMap::new(),
        }
    }

    pub fn with_wait(mut self, wait_secs: u32) -> Self {
        self.wait = wait_secs;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.body.name()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Answer {
    pub result: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Answer {
    pub fn success(details: impl Into<String>) -> Self {
        Self {
            result: true,
            details: details.into(),
            payload: None,
        }
    }

    pub fn success_with(details: impl Into<String>, payload: Value) -> Self {
        Self {
            result: true,
            details: details.into(),
            payload: Some(payload),
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: details.into(),
            payload: None,
        }
    }

    pub fn unsupported(cmd: &Command) -> Self {
        Self::failure(format!("unsupported command: {}", cmd.name()))
    }
}
