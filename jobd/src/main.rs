// SPDX-License-Identifier: MIT
// jobd: asynchronous job execution and agent command dispatch
//
// - Runs an async job manager on an in-memory store and a local bus.
// - Either submits one agent command as a job and prints the finished
//   record, or keeps running until SIGINT or SIGTERM.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::time::Duration;

use agent_commands::{Answer, Command};
use anyhow::Context;
use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use clap::Parser;
use futures::executor::block_on;
use log::info;
use nix::sys::signal::{SigSet, Signal};
use serde_json::Value;

use jobd::endpoint::{HostAddress, LocalEndPoint, LocalResource};
use jobd::global_config::{self, GlobalConfig, OrphanPolicyKind};
use jobd::manager::{AsyncJobManager, EndPointDispatcher};
use jobd::message_bus::LocalMessageBus;
use jobd::store::MemoryJobStore;
use jobd::{AsyncJob, JobStatus, Msid};

const AGENT_COMMAND_DISPATCHER: &str = "agent-command";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Instance id. Derived from hostname and pid if not given.
    #[arg(long)]
    msid: Option<u64>,

    /// Workers running jobs and background loops
    #[arg(long, default_value_t = 8)]
    worker_threads: usize,

    /// Workers running endpoint answer callbacks
    #[arg(long, default_value_t = 4)]
    callback_threads: usize,

    /// Depth limit of every sync queue
    #[arg(long, default_value_t = 10)]
    queue_size_limit: usize,

    #[arg(long = "heartbeat-interval-ms", default_value_t = 2000)]
    heartbeat_interval_ms: u64,

    /// What to do with jobs of instances that stopped heartbeating
    #[arg(long, value_enum, default_value_t)]
    orphan_policy: OrphanPolicyKind,

    /// Agent command to run as a job (JSON encoded)
    #[arg(long, value_name = "JSON")]
    submit: Option<String>,

    /// Agent command to run as a job (base64-encoded JSON)
    #[arg(long = "submit-base64", value_name = "BASE64")]
    submit_base64: Option<String>,

    /// Serialize the submitted job on this object, e.g. "vm:42"
    #[arg(long, value_name = "TYPE:ID")]
    sync_object: Option<String>,

    /// How long to wait for the submitted job
    #[arg(long, default_value_t = 60)]
    wait_secs: u64,
}

fn parse_sync_object(value: &str) -> Result<(String, u64), String> {
    let (obj_type, obj_id) = value
        .split_once(':')
        .ok_or_else(|| format!("--sync-object '{}' is not of the form TYPE:ID", value))?;
    if obj_type.is_empty() {
        return Err("--sync-object needs a non-empty type".into());
    }
    let obj_id = obj_id
        .parse()
        .map_err(|e| format!("--sync-object id '{}': {}", obj_id, e))?;
    Ok((obj_type.to_string(), obj_id))
}

fn validate_args(args: &Args) -> Result<(), String> {
    let submit = match (&args.submit, &args.submit_base64) {
        (Some(_), Some(_)) => {
            return Err("--submit and --submit-base64 may not be used together".into());
        }
        (None, None) => false,
        _ => true,
    };

    if let Some(sync_object) = &args.sync_object {
        if !submit {
            return Err("--sync-object requires --submit or --submit-base64".into());
        }
        parse_sync_object(sync_object)?;
    }

    if args.worker_threads == 0 || args.callback_threads == 0 {
        return Err("--worker-threads and --callback-threads must be at least 1".into());
    }
    if args.heartbeat_interval_ms == 0 {
        return Err("--heartbeat-interval-ms must be positive".into());
    }

    Ok(())
}

/// Stands in for an agent: every command succeeds on the local host and the
/// answer echoes the command.
struct LoopbackHost;

#[async_trait]
impl LocalResource for LoopbackHost {
    async fn execute(&self, cmd: &Command) -> Answer {
        let echo = serde_json::to_value(cmd).unwrap_or(Value::Null);
        Answer::success_with(format!("{} executed on the local host", cmd.name()), echo)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let submit = match (&args.submit, &args.submit_base64) {
        (Some(json), None) => Some(json.clone()),
        (None, Some(b64)) => {
            let decoded = BASE64_STANDARD
                .decode(b64)
                .context("--submit-base64 is not valid base64")?;
            Some(String::from_utf8(decoded).context("--submit-base64 is not UTF-8")?)
        }
        (None, None) => None,
        _ => unreachable!("validate_args enforces mutual exclusion"),
    };
    let command: Option<Command> = submit
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .context("the submitted command is not a valid agent command")?;

    // the worker pools inherit the mask, so sigwait below sees the signals
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if command.is_none() {
        signals.thread_block().context("failed to block SIGINT and SIGTERM")?;
    }

    global_config::initialize_global_config(GlobalConfig {
        msid: args.msid.map(Msid).unwrap_or_else(Msid::current),
        worker_threads: args.worker_threads,
        callback_threads: args.callback_threads,
        queue_size_limit: args.queue_size_limit,
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        orphan_policy: args.orphan_policy,
    });

    let manager = AsyncJobManager::new(
        global_config::get_config().to_manager_config(),
        Arc::new(MemoryJobStore::new()),
        Arc::new(LocalMessageBus::new()),
    )?;
    let local_host = LocalEndPoint::new(
        HostAddress::new(0, "127.0.0.1"),
        Arc::new(LoopbackHost),
        manager.callbacks(),
    );
    manager.register_dispatcher(
        AGENT_COMMAND_DISPATCHER,
        Arc::new(EndPointDispatcher::new(Arc::new(local_host))),
    );
    block_on(manager.start())?;

    info!("Starting jobd as {}", manager.msid());

    let Some(command) = command else {
        let signal = signals.wait().context("waiting for a signal failed")?;
        info!("Received {:?}", signal);
        manager.shutdown();
        return Ok(());
    };

    let job = AsyncJob::for_command(AGENT_COMMAND_DISPATCHER, command.name(), &command)?;
    let id = match args.sync_object.as_deref().map(parse_sync_object) {
        Some(Ok((obj_type, obj_id))) => {
            block_on(manager.submit_async_job_with_sync(job, &obj_type, obj_id))?
        }
        Some(Err(e)) => anyhow::bail!(e),
        None => block_on(manager.submit_async_job(job))?,
    };
    let job = block_on(manager.wait_for_job(id, Duration::from_secs(args.wait_secs)))?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    info!("Stopping jobd");
    manager.shutdown();

    if job.status != JobStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
