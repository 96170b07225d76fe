// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use agent_commands::{Answer, Command};
use async_trait::async_trait;

use super::{AnswerCallback, EndPoint, HostAddress};
use crate::agent::AgentRegistry;
use crate::error::AgentError;

/// Forwards to the live agent connection of one host.
pub struct DirectAgentEndPoint {
    host: HostAddress,
    registry: Arc<AgentRegistry>,
}

impl DirectAgentEndPoint {
    pub fn new(host: HostAddress, registry: Arc<AgentRegistry>) -> Self {
        Self { host, registry }
    }

    /// Like `send_message`, but keeps "unreachable" and "timed out" apart
    /// from a command the agent rejected.
    pub async fn try_send_message(&self, cmd: &Command) -> Result<Answer, AgentError> {
        try_send(&self.registry, &self.host, cmd).await
    }
}

async fn try_send(
    registry: &AgentRegistry,
    host: &HostAddress,
    cmd: &Command,
) -> Result<Answer, AgentError> {
    let channel = registry
        .channel(host.id)
        .ok_or_else(|| AgentError::Unavailable {
            host: host.id,
            reason: "agent not connected".to_string(),
        })?;
    channel.send(cmd).await
}

fn negative(err: AgentError) -> Answer {
    Answer::failure(err.to_string())
}

#[async_trait]
impl EndPoint for DirectAgentEndPoint {
    fn host(&self) -> &HostAddress {
        &self.host
    }

    async fn send_message(&self, cmd: Command) -> Answer {
        self.try_send_message(&cmd).await.unwrap_or_else(negative)
    }

    fn send_message_async(&self, cmd: Command, callback: AnswerCallback) {
        let registry = self.registry.clone();
        let host = self.host.clone();
        let desc = format!("{} to host {}", cmd, host.id);
        self.registry.callbacks().deliver(
            desc,
            async move { try_send(&registry, &host, &cmd).await.unwrap_or_else(negative) },
            callback,
        );
    }
}
