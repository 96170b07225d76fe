// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;

use super::channel::{AgentDispatchChannel, DEFAULT_AGENT_TIMEOUT};
use super::retry::RetryPolicy;
use super::transport::{AgentTransport, CommandRouter, IdentityRouter};
use crate::endpoint::{DirectAgentEndPoint, HostAddress, HostId};
use crate::job_engine::Executor;

/// Live agent connections of this instance, by host id.
pub struct AgentRegistry {
    channels: RwLock<HashMap<HostId, Arc<AgentDispatchChannel>>>,
    transport: Arc<dyn AgentTransport>,
    router: Arc<dyn CommandRouter>,
    timeout: Duration,
    retry: RetryPolicy,
    callbacks: Arc<Executor>,
}

impl AgentRegistry {
    pub fn new(transport: Arc<dyn AgentTransport>, callbacks: Arc<Executor>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            transport,
            router: Arc::new(IdentityRouter),
            timeout: DEFAULT_AGENT_TIMEOUT,
            retry: RetryPolicy::none(),
            callbacks,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn CommandRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn callbacks(&self) -> &Arc<Executor> {
        &self.callbacks
    }

    /// Open (or replace) the channel for `host`.
    pub fn connect(&self, host: HostAddress) -> Arc<AgentDispatchChannel> {
        let id = host.id;
        let channel = Arc::new(
            AgentDispatchChannel::new(host, self.transport.clone(), self.callbacks.clone())
                .with_router(self.router.clone())
                .with_timeout(self.timeout)
                .with_retry(self.retry),
        );
        if self
            .channels
            .write()
            .unwrap()
            .insert(id, channel.clone())
            .is_some()
        {
            info!("host {} reconnected", id);
        } else {
            info!("host {} connected", id);
        }
        channel
    }

    pub fn disconnect(&self, host: HostId) -> bool {
        let removed = self.channels.write().unwrap().remove(&host).is_some();
        if removed {
            info!("host {} disconnected", host);
        }
        removed
    }

    pub fn channel(&self, host: HostId) -> Option<Arc<AgentDispatchChannel>> {
        self.channels.read().unwrap().get(&host).cloned()
    }

    pub fn connected_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.channels.read().unwrap().keys().copied().collect();
        hosts.sort_unstable();
        hosts
    }

    /// Endpoint for a currently connected host. The endpoint looks the
    /// channel up again on every send, so a later disconnect turns into
    /// negative answers.
    pub fn endpoint(self: &Arc<Self>, host: HostId) -> Option<DirectAgentEndPoint> {
        let channel = self.channel(host)?;
        Some(DirectAgentEndPoint::new(channel.host().clone(), self.clone()))
    }
}
