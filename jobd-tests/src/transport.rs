// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use agent_commands::{Answer, Command};
use async_trait::async_trait;
use jobd::agent::AgentTransport;
use jobd::endpoint::{HostAddress, HostId};
use jobd::AgentError;

/// How a fake agent reacts to every command it receives.
#[derive(Debug, Clone)]
pub enum AgentBehavior {
    Accept,
    Reject(String),
    Unreachable,
    /// Never answers, the caller's timeout has to fire.
    Hang,
    /// Unreachable for the first `n` sends, then accepts.
    FlakyFor(usize),
}

/// Agent transport with scripted hosts. Unknown hosts are unreachable.
#[derive(Debug, Default)]
pub struct FakeTransport {
    hosts: Mutex<HashMap<HostId, AgentBehavior>>,
    sends: Mutex<HashMap<HostId, usize>>,
    total: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: HostId, behavior: AgentBehavior) -> Self {
        self.set(host, behavior);
        self
    }

    pub fn set(&self, host: HostId, behavior: AgentBehavior) {
        self.hosts.lock().unwrap().insert(host, behavior);
    }

    pub fn sends_to(&self, host: HostId) -> usize {
        self.sends.lock().unwrap().get(&host).copied().unwrap_or(0)
    }

    pub fn total_sends(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn send(&self, host: &HostAddress, cmd: &Command) -> Result<Answer, AgentError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut sends = self.sends.lock().unwrap();
            let count = sends.entry(host.id).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self.hosts.lock().unwrap().get(&host.id).cloned();
        let unreachable = AgentError::Unavailable {
            host: host.id,
            reason: "connection refused".to_string(),
        };
        match behavior {
            Some(AgentBehavior::Accept) => Ok(Answer::success(format!(
                "{} done on host {}",
                cmd.name(),
                host.id
            ))),
            Some(AgentBehavior::Reject(reason)) => Ok(Answer::failure(reason)),
            Some(AgentBehavior::Hang) => std::future::pending().await,
            Some(AgentBehavior::FlakyFor(n)) if attempt > n => {
                Ok(Answer::success(format!("{} done on attempt {}", cmd.name(), attempt)))
            }
            Some(AgentBehavior::FlakyFor(_)) | Some(AgentBehavior::Unreachable) | None => {
                Err(unreachable)
            }
        }
    }
}
