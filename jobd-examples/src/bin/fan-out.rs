// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

// A parent job copies several volumes in parallel. It submits one child per
// volume, parks on asynchronous joins and is woken once per finished child.

use std::sync::Arc;
use std::time::Duration;

use agent_commands::{Answer, Command, CommandBody};
use async_trait::async_trait;
use futures::executor::block_on;
use log::info;
use serde_json::{json, Value};

use jobd::endpoint::{HostAddress, LocalEndPoint, LocalResource};
use jobd::job::{JournalType, WakeupSpec};
use jobd::job_engine::sleep;
use jobd::manager::{ClosureDispatcher, EndPointDispatcher, ManagerConfig};
use jobd::message_bus::LocalMessageBus;
use jobd::store::MemoryJobStore;
use jobd::{AsyncJob, AsyncJobManager, JobError, JobException, JobOutcome};

struct SlowStorage;

#[async_trait]
impl LocalResource for SlowStorage {
    async fn execute(&self, cmd: &Command) -> Answer {
        match &cmd.body {
            CommandBody::CopyVolume { src_path, dest_pool_uuid } => {
                sleep(Duration::from_millis(200)).await;
                Answer::success(format!("{} copied to pool {}", src_path, dest_pool_uuid))
            }
            _ => Answer::unsupported(cmd),
        }
    }
}

fn copy_all() -> ClosureDispatcher {
    ClosureDispatcher::from_async("copy-all", |ctx| async move {
        match ctx.wakeup().cloned() {
            None => {
                let volumes: Vec<String> = ctx.command()?;
                for src_path in volumes {
                    let cmd = Command::new(CommandBody::CopyVolume {
                        src_path,
                        dest_pool_uuid: "pool-b".to_string(),
                    });
                    let child = AsyncJob::for_command("agent-command", cmd.name(), &cmd)
                        .map_err(JobError::from)?;
                    let child = ctx.submit_child(child).await?;
                    let spec = WakeupSpec::new("", Duration::from_secs(1), Duration::from_secs(60));
                    ctx.join_job_with_wakeup(child, spec).await?;
                }
            }
            Some(wakeup) => {
                let joined = ctx.disjoin_job(wakeup.child).await?;
                let details = joined
                    .value()
                    .and_then(|answer| answer["details"].as_str().map(str::to_string))
                    .unwrap_or_default();
                ctx.log_journal(JournalType::Success, details, None).await?;
            }
        }

        let pending = ctx
            .manager()
            .store()
            .find_joins_by_parent(ctx.job_id())
            .await
            .map_err(JobError::from)?;
        if pending.is_empty() {
            let copied = ctx.manager().list_journal(ctx.job_id()).await?.len();
            Ok::<_, JobException>(JobOutcome::Succeeded(Some(json!({ "copied": copied }))))
        } else {
            info!("job-{}: {} copies still running", ctx.job_id(), pending.len());
            Ok(JobOutcome::Suspended)
        }
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let manager = AsyncJobManager::new(
        ManagerConfig::default().with_heartbeat_interval(Duration::from_millis(500)),
        Arc::new(MemoryJobStore::new()),
        Arc::new(LocalMessageBus::new()),
    )?;
    let storage = LocalEndPoint::new(
        HostAddress::new(1, "127.0.0.1"),
        Arc::new(SlowStorage),
        manager.callbacks(),
    );
    manager.register_dispatcher(
        "agent-command",
        Arc::new(EndPointDispatcher::new(Arc::new(storage))),
    );
    manager.register_dispatcher("copy-all", Arc::new(copy_all()));
    block_on(manager.start())?;

    let volumes = json!(["/vol/root.qcow2", "/vol/data.qcow2", "/vol/swap.qcow2"]);
    let id = block_on(manager.submit_async_job(AsyncJob::new(
        "copy-all",
        "copy-volumes",
        volumes.to_string(),
    )))?;
    let job = block_on(manager.wait_for_job(id, Duration::from_secs(30)))?;

    info!("job-{} finished as {:?}", id, job.status);
    for entry in block_on(manager.list_journal(id))? {
        info!("  {}", entry.text);
    }
    println!("{}", job.result_value().unwrap_or(Value::Null));

    manager.shutdown();
    Ok(())
}
