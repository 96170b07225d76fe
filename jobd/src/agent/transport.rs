// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use agent_commands::{Answer, Command};
use async_trait::async_trait;

use crate::endpoint::HostAddress;
use crate::error::AgentError;

/// The messaging layer that actually moves a command to an agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, host: &HostAddress, cmd: &Command) -> Result<Answer, AgentError>;
}

/// Decides the real destination of a command, e.g. after an HA failover.
pub trait CommandRouter: Send + Sync {
    fn route(&self, nominal: &HostAddress, cmd: &Command) -> HostAddress;
}

/// Sends every command to its nominal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRouter;

impl CommandRouter for IdentityRouter {
    fn route(&self, nominal: &HostAddress, _cmd: &Command) -> HostAddress {
        nominal.clone()
    }
}
