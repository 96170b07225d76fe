// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

// Two hypervisor hosts, one of which drops off the network halfway. Commands
// for the lost host are routed to its HA partner; idempotent commands ride
// out short outages through retries.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use agent_commands::{Answer, Command, CommandBody};
use async_trait::async_trait;
use futures::executor::block_on;
use log::{info, warn};

use jobd::agent::{AgentRegistry, AgentTransport, Backoff, CommandRouter, RetryPolicy};
use jobd::endpoint::{EndPoint, HostAddress, HostId};
use jobd::manager::{EndPointDispatcher, ManagerConfig};
use jobd::message_bus::LocalMessageBus;
use jobd::store::MemoryJobStore;
use jobd::{AgentError, AsyncJob, AsyncJobManager, JobStatus};

/// Hosts currently reachable over the simulated network.
#[derive(Default)]
struct Network {
    up: RwLock<HashSet<HostId>>,
}

impl Network {
    fn set_up(&self, host: HostId, up: bool) {
        let mut hosts = self.up.write().unwrap();
        if up {
            hosts.insert(host);
        } else {
            hosts.remove(&host);
        }
    }

    fn is_up(&self, host: HostId) -> bool {
        self.up.read().unwrap().contains(&host)
    }
}

struct SimulatedAgents(Arc<Network>);

#[async_trait]
impl AgentTransport for SimulatedAgents {
    async fn send(&self, host: &HostAddress, cmd: &Command) -> Result<Answer, AgentError> {
        if !self.0.is_up(host.id) {
            return Err(AgentError::Unavailable {
                host: host.id,
                reason: "no route to host".to_string(),
            });
        }
        Ok(Answer::success(format!("{} executed on {}", cmd, host.address)))
    }
}

/// Sends commands for a host that went down to its partner.
struct HaPartner {
    network: Arc<Network>,
    partner: HostAddress,
}

impl CommandRouter for HaPartner {
    fn route(&self, nominal: &HostAddress, _cmd: &Command) -> HostAddress {
        if self.network.is_up(nominal.id) || nominal.id == self.partner.id {
            nominal.clone()
        } else {
            self.partner.clone()
        }
    }
}

fn run(manager: &AsyncJobManager, dispatcher: &str, cmd: &Command) -> anyhow::Result<()> {
    let job = AsyncJob::for_command(dispatcher, cmd.name(), cmd)?;
    let id = block_on(manager.submit_async_job(job))?;
    let job = block_on(manager.wait_for_job(id, Duration::from_secs(10)))?;
    if job.status == JobStatus::Succeeded {
        info!("job-{} {}: {}", id, cmd, job.result_value().unwrap_or_default()["details"]);
    } else {
        warn!("job-{} {} failed: {}", id, cmd, job.result.unwrap_or_default());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let network = Arc::new(Network::default());
    network.set_up(1, true);
    network.set_up(2, true);
    let host_a = HostAddress::new(1, "10.0.0.1");
    let host_b = HostAddress::new(2, "10.0.0.2");

    let manager = AsyncJobManager::new(
        ManagerConfig::default(),
        Arc::new(MemoryJobStore::new()),
        Arc::new(LocalMessageBus::new()),
    )?;
    let registry = Arc::new(
        AgentRegistry::new(Arc::new(SimulatedAgents(network.clone())), manager.callbacks())
            .with_router(Arc::new(HaPartner {
                network: network.clone(),
                partner: host_b.clone(),
            }))
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::new(4, Backoff::exponential(Duration::from_millis(100)))),
    );
    registry.connect(host_a);
    registry.connect(host_b);

    let Some(endpoint) = registry.endpoint(1) else {
        anyhow::bail!("host 1 did not connect");
    };
    info!("dispatching to host {} at {}", endpoint.id(), endpoint.host_addr());
    manager.register_dispatcher("host-a", Arc::new(EndPointDispatcher::new(Arc::new(endpoint))));
    block_on(manager.start())?;

    let attach = Command::new(CommandBody::AttachVolume {
        vm_name: "i-2-10-VM".to_string(),
        volume_path: "/vol/data.qcow2".to_string(),
    });
    run(&manager, "host-a", &attach)?;

    info!("host 1 lost its network link");
    network.set_up(1, false);
    run(&manager, "host-a", &attach)?;

    // the partner drops out briefly too; the idempotent command is resent
    // until it is back
    network.set_up(2, false);
    let net = network.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(250));
        net.set_up(2, true);
    });
    let ready = Command::new(CommandBody::Ready { host_id: 2 }).idempotent();
    run(&manager, "host-a", &ready)?;

    manager.shutdown();
    Ok(())
}
