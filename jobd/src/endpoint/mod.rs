// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! A place that can execute a [`Command`] and return an [`Answer`].
//!
//! Three flat variants exist: [`LocalEndPoint`] runs the command in this
//! process, [`DirectAgentEndPoint`] forwards it over a live agent channel and
//! [`RemoteRpcEndPoint`] asks the peer instance that owns the resource.
//!
//! Contract shared by all of them:
//! - `send_message` never fails for ordinary failure modes, it returns a
//!   negative answer instead.
//! - `send_message_async` invokes its callback exactly once, on a pool
//!   thread, never on the caller's thread.

pub mod direct_agent;
pub mod local;
pub mod remote_rpc;

use agent_commands::{Answer, Command};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use direct_agent::DirectAgentEndPoint;
pub use local::{LocalEndPoint, LocalResource};
pub use remote_rpc::{
    AgentCommandService, LoopbackRpc, RemoteRpcEndPoint, RpcCallback, RpcHandler, RpcProvider,
    AGENT_COMMAND_SERVICE,
};

pub type HostId = u64;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HostAddress {
    pub id: HostId,
    /// Address the orchestrator uses to reach the agent.
    pub address: String,
    /// Address as seen from outside, differs for agents behind NAT.
    pub public_address: String,
}

impl HostAddress {
    pub fn new(id: HostId, address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id,
            public_address: address.clone(),
            address,
        }
    }

    pub fn with_public_address(mut self, public_address: impl Into<String>) -> Self {
        self.public_address = public_address.into();
        self
    }
}

pub type AnswerCallback = Box<dyn FnOnce(Answer) + Send + 'static>;

#[async_trait]
pub trait EndPoint: Send + Sync {
    fn host(&self) -> &HostAddress;

    fn id(&self) -> HostId {
        self.host().id
    }

    fn host_addr(&self) -> &str {
        &self.host().address
    }

    fn public_addr(&self) -> &str {
        &self.host().public_address
    }

    async fn send_message(&self, cmd: Command) -> Answer;

    fn send_message_async(&self, cmd: Command, callback: AnswerCallback);
}
