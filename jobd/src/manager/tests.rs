// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use super::*;
use crate::message_bus::LocalMessageBus;
use crate::store::MemoryJobStore;
use async_channel::{Receiver, Sender};
use futures::executor::block_on;

fn test_config() -> ManagerConfig {
    ManagerConfig {
        worker_threads: 4,
        callback_threads: 1,
        ..ManagerConfig::default()
    }
    .with_msid(Msid(1))
    .with_heartbeat_interval(Duration::from_millis(50))
    .with_wakeup_interval(Duration::from_millis(20))
}

fn manager_with(config: ManagerConfig) -> (AsyncJobManager, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let bus = Arc::new(LocalMessageBus::new());
    let manager = AsyncJobManager::new(config, store.clone(), bus).unwrap();
    (manager, store)
}

fn manager() -> (AsyncJobManager, Arc<MemoryJobStore>) {
    manager_with(test_config())
}

fn wait_done(manager: &AsyncJobManager, id: JobId) -> AsyncJob {
    let job = block_on(manager.wait_for_job(id, Duration::from_secs(10))).unwrap();
    assert!(job.is_terminal(), "job-{} still {:?}", id, job.status);
    job
}

fn wait_until(manager: &AsyncJobManager, id: JobId, pred: impl Fn(&AsyncJob) -> bool) -> AsyncJob {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = block_on(manager.query_job(id, false)).unwrap();
        if pred(&job) {
            return job;
        }
        assert!(Instant::now() < deadline, "job-{} stuck as {:?}", id, job.status);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn succeed_with(value: Value) -> Arc<dyn JobDispatcher> {
    Arc::new(ClosureDispatcher::from_async("succeed", move |_ctx| {
        let value = value.clone();
        async move { Ok(JobOutcome::Succeeded(Some(value))) }
    }))
}

/// Dispatcher that blocks until the returned sender is closed.
fn gated(value: Value) -> (Arc<dyn JobDispatcher>, Sender<()>) {
    let (tx, rx): (Sender<()>, Receiver<()>) = async_channel::unbounded();
    let dispatcher = ClosureDispatcher::from_async("gated", move |_ctx| {
        let rx = rx.clone();
        let value = value.clone();
        async move {
            let _ = rx.recv().await;
            Ok(JobOutcome::Succeeded(Some(value)))
        }
    });
    (Arc::new(dispatcher), tx)
}

#[test]
fn submitted_job_runs_to_success() {
    let (m, _store) = manager();
    m.register_dispatcher("ok", succeed_with(json!("done")));

    let id = block_on(m.submit_async_job(AsyncJob::new("ok", "do-it", "{}"))).unwrap();
    let job = wait_done(&m, id);

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result_code, result_code::SUCCESS);
    assert_eq!(job.result_value(), Some(json!("done")));
    assert_eq!(job.init_msid, Some(Msid(1)));
    assert_eq!(job.complete_msid, Some(Msid(1)));
    assert_eq!(job.executing_msid, None);
    m.shutdown();
}

#[test]
fn unknown_dispatcher_is_rejected_at_submit() {
    let (m, store) = manager();
    let err = block_on(m.submit_async_job(AsyncJob::new("nobody", "c", "{}"))).unwrap_err();
    assert!(matches!(err, JobError::NoSuchDispatcher(name) if name == "nobody"));
    assert_eq!(store.job_count(), 0);
}

#[test]
fn disabled_intake_rejects_until_enabled_again() {
    let (m, _store) = manager();
    m.register_dispatcher("ok", succeed_with(json!(1)));

    m.disable_async_jobs();
    assert!(!m.is_async_jobs_enabled());
    let err = block_on(m.submit_async_job(AsyncJob::new("ok", "c", "{}"))).unwrap_err();
    assert!(matches!(err, JobError::JobsDisabled));

    m.enable_async_jobs();
    let id = block_on(m.submit_async_job(AsyncJob::new("ok", "c", "{}"))).unwrap();
    assert_eq!(wait_done(&m, id).status, JobStatus::Succeeded);
    m.shutdown();
}

#[test]
fn dispatcher_exception_is_stored_with_its_code() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "full",
        Arc::new(ClosureDispatcher::from_async("full", |_ctx| async {
            Err(JobException::insufficient_capacity("no host left"))
        })),
    );

    let id = block_on(m.submit_async_job(AsyncJob::new("full", "c", "{}"))).unwrap();
    let job = wait_done(&m, id);

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::INSUFFICIENT_CAPACITY);
    let exc = JobException::from_result(job.result.as_deref().unwrap()).unwrap();
    assert_eq!(exc, JobException::insufficient_capacity("no host left"));
    m.shutdown();
}

#[test]
fn panicking_dispatcher_fails_the_job() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "boom",
        Arc::new(ClosureDispatcher::from_async("boom", |_ctx| async {
            if true {
                panic!("boom");
            }
            Ok(JobOutcome::Completed)
        })),
    );

    let id = block_on(m.submit_async_job(AsyncJob::new("boom", "c", "{}"))).unwrap();
    let job = wait_done(&m, id);

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::INTERNAL_ERROR);
    assert!(job.result.unwrap().contains("boom"));

    // the pool survives the panic
    m.register_dispatcher("ok", succeed_with(json!(1)));
    let id = block_on(m.submit_async_job(AsyncJob::new("ok", "c", "{}"))).unwrap();
    assert_eq!(wait_done(&m, id).status, JobStatus::Succeeded);
    m.shutdown();
}

#[test]
fn completed_outcome_without_completion_fails() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "lazy",
        Arc::new(ClosureDispatcher::from_async("lazy", |_ctx| async {
            Ok(JobOutcome::Completed)
        })),
    );
    m.register_dispatcher(
        "explicit",
        Arc::new(ClosureDispatcher::from_async("explicit", |ctx| async move {
            ctx.complete(JobStatus::Succeeded, result_code::SUCCESS, Some(json!("by hand")))
                .await?;
            Ok::<_, JobException>(JobOutcome::Completed)
        })),
    );

    let lazy = block_on(m.submit_async_job(AsyncJob::new("lazy", "c", "{}"))).unwrap();
    let explicit = block_on(m.submit_async_job(AsyncJob::new("explicit", "c", "{}"))).unwrap();

    assert_eq!(wait_done(&m, lazy).status, JobStatus::Failed);
    let job = wait_done(&m, explicit);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result_value(), Some(json!("by hand")));
    m.shutdown();
}

#[test]
fn sync_jobs_run_one_at_a_time_in_submission_order() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("ok"));
    m.register_dispatcher("gated", dispatcher);

    let first = block_on(m.submit_async_job_with_sync(AsyncJob::new("gated", "c", "{}"), "vm", 42))
        .unwrap();
    let second = block_on(m.submit_async_job_with_sync(AsyncJob::new("gated", "c", "{}"), "vm", 42))
        .unwrap();

    wait_until(&m, first, |j| j.status == JobStatus::InProgress);
    let waiting = block_on(m.query_job(second, false)).unwrap();
    assert_eq!(waiting.status, JobStatus::Queued);
    assert!(waiting.sync_item_id.is_some());

    // a queued job cannot be completed through the public api
    let err = block_on(m.complete_async_job(second, JobStatus::Succeeded, 0, None)).unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { status: JobStatus::Queued, .. }));

    gate.close();
    let first = wait_done(&m, first);
    let second = wait_done(&m, second);
    assert_eq!(second.status, JobStatus::Succeeded);
    assert!(first.last_updated <= second.last_updated);
    assert_eq!(
        block_on(m.sync_queues().depth(&SyncObject::new("vm", 42))).unwrap(),
        0
    );
    m.shutdown();
}

#[test]
fn full_sync_queue_rejects_and_keeps_a_failed_record() {
    let config = test_config().with_queue_size_limit(1);
    let (m, _store) = manager_with(config);
    let (dispatcher, gate) = gated(json!("ok"));
    m.register_dispatcher("gated", dispatcher);

    let first = block_on(m.submit_async_job_with_sync(AsyncJob::new("gated", "c", "{}"), "vm", 7))
        .unwrap();
    let err = block_on(m.submit_async_job_with_sync(AsyncJob::new("gated", "c", "{}"), "vm", 7))
        .unwrap_err();
    assert!(matches!(err, JobError::QueueFull { limit: 1, .. }));

    let rejected = block_on(m.query_job(first + 1, false)).unwrap();
    assert_eq!(rejected.status, JobStatus::Failed);
    assert_eq!(rejected.result_code, result_code::QUEUE_REJECTED);

    gate.close();
    assert_eq!(wait_done(&m, first).status, JobStatus::Succeeded);
    m.shutdown();
}

#[test]
fn cancelling_a_waiting_job_withdraws_it_from_its_queue() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("ok"));
    m.register_dispatcher("gated", dispatcher);

    let submit = || {
        block_on(m.submit_async_job_with_sync(AsyncJob::new("gated", "c", "{}"), "vm", 9)).unwrap()
    };
    let (first, second, third) = (submit(), submit(), submit());
    wait_until(&m, first, |j| j.status == JobStatus::InProgress);

    assert!(block_on(m.cancel_async_job(second, "operator request")).unwrap());
    assert!(!block_on(m.cancel_async_job(second, "again")).unwrap());
    let cancelled = block_on(m.query_job(second, false)).unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.result_code, result_code::CANCELLED);
    assert_eq!(
        block_on(m.sync_queues().depth(&SyncObject::new("vm", 9))).unwrap(),
        2
    );

    gate.close();
    assert_eq!(wait_done(&m, first).status, JobStatus::Succeeded);
    assert_eq!(wait_done(&m, third).status, JobStatus::Succeeded);
    m.shutdown();
}

#[test]
fn progress_journal_and_attachment() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "worker",
        Arc::new(ClosureDispatcher::from_async("worker", |ctx| async move {
            ctx.update_progress(50, Some(json!({"step": 1}))).await?;
            ctx.update_attachment("VirtualMachine", 42).await?;
            ctx.log_journal(JournalType::Info, "half way", Some(json!({"step": 1})))
                .await?;
            let seen = ctx.refresh().await?;
            Ok::<_, JobException>(JobOutcome::Succeeded(Some(json!(seen.process_status))))
        })),
    );

    let id = block_on(m.submit_async_job(AsyncJob::new("worker", "c", "{}"))).unwrap();
    let job = wait_done(&m, id);

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.process_status, 50);
    assert_eq!(job.result_value(), Some(json!(50)));
    assert_eq!(job.instance_type.as_deref(), Some("VirtualMachine"));
    assert_eq!(job.instance_id, Some(42));

    let journal = block_on(m.list_journal(id)).unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].text, "half way");

    let err = block_on(m.log_job_journal(id, JournalType::Info, "late", None)).unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { .. }));
    let err = block_on(m.update_async_job_status(id, 60, None)).unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { .. }));
    m.shutdown();
}

#[test]
fn query_with_poll_time_stamps_the_record() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("ok"));
    m.register_dispatcher("gated", dispatcher);
    let id = block_on(m.submit_async_job(AsyncJob::new("gated", "c", "{}"))).unwrap();

    assert!(block_on(m.query_job(id, false)).unwrap().last_polled.is_none());
    assert!(block_on(m.query_job(id, true)).unwrap().last_polled.is_some());
    assert!(matches!(
        block_on(m.query_job(id + 100, true)),
        Err(JobError::JobNotFound(_))
    ));

    gate.close();
    wait_done(&m, id);
    m.shutdown();
}

#[test]
fn losing_completion_changes_nothing() {
    let (m, _store) = manager();
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();
    let mut job = AsyncJob::new(PSEUDO_DISPATCHER, "c", "{}");
    job.status = JobStatus::InProgress;
    let job = block_on(m.store().insert_job(job)).unwrap();

    assert!(block_on(m.complete_async_job(job.id, JobStatus::Failed, 1, Some(json!("first")))).unwrap());
    assert!(!block_on(m.complete_async_job(job.id, JobStatus::Succeeded, 0, None)).unwrap());
    let stored = block_on(m.query_job(job.id, false)).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.result_value(), Some(json!("first")));

    let err = block_on(m.complete_async_job(ctx.job_id(), JobStatus::InProgress, 0, None))
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { .. }));
}

#[test]
fn pseudo_job_is_reused_and_expunged_on_restart() {
    let (m, _store) = manager();
    let first = block_on(m.pseudo_job(2, 3)).unwrap();
    let again = block_on(m.pseudo_job(2, 3)).unwrap();
    let other = block_on(m.pseudo_job(2, 4)).unwrap();

    assert_eq!(first.id, again.id);
    assert_ne!(first.id, other.id);
    assert!(first.pseudo);
    assert_eq!(first.status, JobStatus::InProgress);
    assert_eq!(block_on(m.count_pending_non_pseudo_jobs(Msid(1))).unwrap(), 0);

    block_on(m.start()).unwrap();
    assert!(matches!(
        block_on(m.query_job(first.id, false)),
        Err(JobError::JobNotFound(_))
    ));
    m.shutdown();
}

#[test]
fn pseudo_context_can_join_and_wait() {
    let (m, _store) = manager();
    m.register_dispatcher("ok", succeed_with(json!({"vm": 42})));
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();

    let child = block_on(ctx.submit_child(AsyncJob::new("ok", "c", "{}"))).unwrap();
    let result = block_on(ctx.join_and_wait(child, Duration::from_secs(10))).unwrap();

    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(result.value(), Some(json!({"vm": 42})));
    assert!(block_on(m.store().find_join(ctx.job_id(), child)).unwrap().is_none());
    assert_eq!(block_on(m.query_job(child, false)).unwrap().related, Some(ctx.job_id()));
    m.shutdown();
}

#[test]
fn join_and_wait_times_out_and_drops_the_join() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("late"));
    m.register_dispatcher("gated", dispatcher);
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();

    let child = block_on(ctx.submit_child(AsyncJob::new("gated", "c", "{}"))).unwrap();
    let err = block_on(ctx.join_and_wait(child, Duration::from_millis(60))).unwrap_err();
    assert!(matches!(err, JobError::JoinTimedOut { child: c, .. } if c == child));
    assert!(block_on(m.store().find_join(ctx.job_id(), child)).unwrap().is_none());

    gate.close();
    wait_done(&m, child);
    m.shutdown();
}

#[test]
fn failed_child_is_rethrown_on_disjoin() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "busy",
        Arc::new(ClosureDispatcher::from_async("busy", |_ctx| async {
            Err(JobException::concurrent_operation("vm is migrating"))
        })),
    );
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();
    let child = block_on(ctx.submit_child(AsyncJob::new("busy", "c", "{}"))).unwrap();

    let err = block_on(ctx.join_and_wait(child, Duration::from_secs(10))).unwrap_err();
    assert!(matches!(err, JobError::ConcurrentOperation(msg) if msg == "vm is migrating"));
    m.shutdown();
}

#[test]
fn duplicate_and_self_joins_are_rejected() {
    let (m, _store) = manager();
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();
    let mut child = AsyncJob::new(PSEUDO_DISPATCHER, "c", "{}");
    child.status = JobStatus::InProgress;
    let child = block_on(m.store().insert_job(child)).unwrap();

    block_on(ctx.join_job(child.id)).unwrap();
    assert!(matches!(
        block_on(ctx.join_job(child.id)),
        Err(JobError::DuplicateJoin { .. })
    ));
    assert!(matches!(
        block_on(ctx.join_job(ctx.job_id())),
        Err(JobError::InvalidTransition { .. })
    ));
    assert!(matches!(
        block_on(m.disjoin_job(ctx.job_id(), child.id + 100)),
        Err(JobError::JoinNotFound { .. })
    ));
}

#[test]
fn external_completion_resolves_joins() {
    let (m, _store) = manager();
    let ctx = block_on(m.pseudo_context(1, 1)).unwrap();
    let mut child = AsyncJob::new(PSEUDO_DISPATCHER, "c", "{}");
    child.status = JobStatus::InProgress;
    let child = block_on(m.store().insert_job(child)).unwrap();
    block_on(ctx.join_job(child.id)).unwrap();

    assert_eq!(
        block_on(m.complete_join(child.id, JobStatus::Failed, Some(json!("gone")))).unwrap(),
        1
    );
    assert_eq!(
        block_on(m.complete_join(child.id, JobStatus::Failed, None)).unwrap(),
        0
    );
    let result = block_on(m.disjoin_job(ctx.job_id(), child.id)).unwrap();
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.value(), Some(json!("gone")));
    // the child itself is untouched
    assert_eq!(
        block_on(m.query_job(child.id, false)).unwrap().status,
        JobStatus::InProgress
    );
}

/// Parent fans out one gated child, suspends and finishes from the wakeup.
fn register_parent(m: &AsyncJobManager, join_timeout: Duration) {
    m.register_dispatcher(
        "parent",
        Arc::new(ClosureDispatcher::from_async("parent", move |ctx| async move {
            match ctx.wakeup().cloned() {
                None => {
                    let child = ctx.submit_child(AsyncJob::new("gated", "c", "{}")).await?;
                    let spec = WakeupSpec::new("", Duration::from_millis(20), join_timeout)
                        .with_handler("collect");
                    ctx.join_job_with_wakeup(child, spec).await?;
                    Ok::<_, JobException>(JobOutcome::Suspended)
                }
                Some(wakeup) => {
                    assert_eq!(wakeup.handler, "collect");
                    let joined = ctx.manager().disjoin_job(ctx.job_id(), wakeup.child).await?;
                    Ok(JobOutcome::Succeeded(Some(json!({
                        "reason": wakeup.reason,
                        "child": joined.value(),
                    }))))
                }
            }
        })),
    );
}

#[test]
fn suspended_parent_resumes_when_child_completes() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("child-ok"));
    m.register_dispatcher("gated", dispatcher);
    register_parent(&m, Duration::from_secs(60));

    let parent = block_on(m.submit_async_job(AsyncJob::new("parent", "c", "{}"))).unwrap();
    let parked = wait_until(&m, parent, |j| j.suspended);
    assert_eq!(parked.status, JobStatus::InProgress);
    assert_eq!(parked.executing_msid, None);

    gate.close();
    let job = wait_done(&m, parent);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(
        job.result_value(),
        Some(json!({"reason": "child-completed", "child": "child-ok"}))
    );
    m.shutdown();
}

#[test]
fn expired_join_wakes_parent_with_timeout() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("too late"));
    m.register_dispatcher("gated", dispatcher);
    register_parent(&m, Duration::from_millis(50));

    let parent = block_on(m.submit_async_job(AsyncJob::new("parent", "c", "{}"))).unwrap();
    wait_until(&m, parent, |j| j.suspended);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(block_on(m.process_wakeups()).unwrap(), 1);
    assert_eq!(block_on(m.process_wakeups()).unwrap(), 0);

    let job = wait_done(&m, parent);
    assert_eq!(
        job.result_value(),
        Some(json!({"reason": "timeout", "child": null}))
    );
    gate.close();
    m.shutdown();
}

#[test]
fn suspending_without_a_wakeup_join_fails_the_job() {
    let (m, _store) = manager();
    m.register_dispatcher(
        "sleepy",
        Arc::new(ClosureDispatcher::from_async("sleepy", |_ctx| async {
            Ok(JobOutcome::Suspended)
        })),
    );
    let id = block_on(m.submit_async_job(AsyncJob::new("sleepy", "c", "{}"))).unwrap();
    let job = wait_done(&m, id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::INTERNAL_ERROR);
    m.shutdown();
}

fn orphan_of(m: &AsyncJobManager, dead: Msid) -> JobId {
    block_on(async {
        let long_ago = now() - Duration::from_secs(3600);
        m.store().record_heartbeat(dead, long_ago).await.unwrap();
        let mut job = AsyncJob::new("ok", "c", "{}");
        job.status = JobStatus::InProgress;
        job.executing_msid = Some(dead);
        m.store().insert_job(job).await.unwrap().id
    })
}

#[test]
fn orphaned_jobs_are_failed_by_default() {
    let (m, _store) = manager();
    m.register_dispatcher("ok", succeed_with(json!(1)));
    let id = orphan_of(&m, Msid(99));

    let orphans = block_on(m.find_orphaned_jobs()).unwrap();
    assert_eq!(orphans.iter().map(|j| j.id).collect::<Vec<_>>(), vec![id]);
    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 1);
    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 0);

    let job = block_on(m.query_job(id, false)).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::ORPHANED);
    assert_eq!(job.complete_msid, Some(Msid(1)));
}

#[test]
fn requeue_policy_runs_orphans_again() {
    let (m, _store) = manager_with(test_config().with_orphan_policy(OrphanPolicyKind::Requeue));
    m.register_dispatcher("ok", succeed_with(json!("again")));
    let id = orphan_of(&m, Msid(99));

    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 1);
    let job = wait_done(&m, id);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.complete_msid, Some(Msid(1)));
    m.shutdown();
}

#[test]
fn leave_policy_keeps_orphans_untouched() {
    let (m, _store) = manager();
    m.set_orphan_policy(Arc::new(LeaveOrphans));
    let id = orphan_of(&m, Msid(99));

    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 0);
    assert_eq!(
        block_on(m.query_job(id, false)).unwrap().status,
        JobStatus::InProgress
    );
}

/// Submitted by `dead` but never started.
fn unstarted_orphan_of(m: &AsyncJobManager, dead: Msid, sync_object: Option<SyncObject>) -> JobId {
    block_on(async {
        let long_ago = now() - Duration::from_secs(3600);
        m.store().record_heartbeat(dead, long_ago).await.unwrap();
        let mut job = AsyncJob::new("ok", "c", "{}");
        job.init_msid = Some(dead);
        job.sync_object = sync_object;
        m.store().insert_job(job).await.unwrap().id
    })
}

#[test]
fn queued_job_of_a_dead_submitter_is_failed() {
    let mut config = test_config();
    config.stale_queue_item_after = Duration::ZERO;
    let (m, _store) = manager_with(config);
    m.register_dispatcher("ok", succeed_with(json!(1)));
    let id = unstarted_orphan_of(&m, Msid(99), None);
    assert_eq!(block_on(m.count_pending_non_pseudo_jobs(Msid(99))).unwrap(), 1);

    for _ in 0..3 {
        block_on(m.heartbeat());
    }
    let job = block_on(m.query_job(id, false)).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::ORPHANED);
    assert_eq!(job.complete_msid, Some(Msid(1)));
    assert_eq!(block_on(m.count_pending_non_pseudo_jobs(Msid(99))).unwrap(), 0);
}

#[test]
fn queued_job_of_a_dead_submitter_is_started_under_requeue() {
    let (m, _store) = manager_with(test_config().with_orphan_policy(OrphanPolicyKind::Requeue));
    m.register_dispatcher("ok", succeed_with(json!("picked up")));
    let id = unstarted_orphan_of(&m, Msid(99), None);

    // repeated sweeps before the claim lands must not run it twice
    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 1);
    block_on(m.reconcile_orphans()).unwrap();
    let job = wait_done(&m, id);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result_value(), Some(json!("picked up")));
    assert_eq!(job.complete_msid, Some(Msid(1)));
    assert_eq!(block_on(m.reconcile_orphans()).unwrap(), 0);
    m.shutdown();
}

#[test]
fn queued_orphans_behind_a_sync_object_are_left_to_the_queue() {
    let (m, _store) = manager();
    let sync_object = SyncObject::new("vm", 6);
    let id = unstarted_orphan_of(&m, Msid(99), Some(sync_object.clone()));
    block_on(m.sync_queues().enqueue(&sync_object, id, None)).unwrap();

    assert!(block_on(m.find_orphaned_jobs()).unwrap().is_empty());
    assert_eq!(block_on(m.query_job(id, false)).unwrap().status, JobStatus::Queued);
}

#[test]
fn journal_of_a_finished_job_is_closed_in_the_store() {
    let (m, store) = manager();
    let mut job = AsyncJob::new("ok", "c", "{}");
    job.status = JobStatus::InProgress;
    let id = block_on(store.insert_job(job)).unwrap().id;

    block_on(m.log_job_journal(id, JournalType::Info, "before", None)).unwrap();
    assert!(block_on(m.complete_async_job(id, JobStatus::Succeeded, result_code::SUCCESS, None)).unwrap());

    // a writer that checked the status before the completion committed
    let late = JobJournal::new(id, JournalType::Info, "after", None);
    let err = block_on(store.append_journal(late)).unwrap_err();
    assert!(matches!(err, StoreError::Terminal { .. }));
    let err = block_on(m.log_job_journal(id, JournalType::Info, "after", None)).unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition { status: JobStatus::Succeeded, .. }));
    let err = block_on(m.log_job_journal(id + 100, JournalType::Info, "x", None)).unwrap_err();
    assert!(matches!(err, JobError::JobNotFound(_)));

    let journal = block_on(m.list_journal(id)).unwrap();
    assert_eq!(journal.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(), vec!["before"]);
}

#[test]
fn sweep_reschedules_admitted_jobs_that_never_started() {
    let mut config = test_config();
    config.stale_queue_item_after = Duration::ZERO;
    let (m, _store) = manager_with(config);
    m.register_dispatcher("ok", succeed_with(json!("swept")));

    // admitted on the slot, but the scheduling was lost
    let sync_object = SyncObject::new("vm", 5);
    let id = block_on(async {
        let mut job = AsyncJob::new("ok", "c", "{}");
        job.sync_object = Some(sync_object.clone());
        let job = m.store().insert_job(job).await.unwrap();
        m.sync_queues().enqueue(&sync_object, job.id, None).await.unwrap();
        job.id
    });

    assert_eq!(block_on(m.sweep_sync_queues()).unwrap(), 1);
    assert_eq!(wait_done(&m, id).result_value(), Some(json!("swept")));
    assert_eq!(block_on(m.sync_queues().depth(&sync_object)).unwrap(), 0);
    m.shutdown();
}

#[test]
fn expired_records_are_expunged() {
    let mut config = test_config();
    config.job_expire_after = Duration::ZERO;
    let (m, store) = manager_with(config);
    m.register_dispatcher("ok", succeed_with(json!(1)));

    let id = block_on(m.submit_async_job(AsyncJob::new("ok", "c", "{}"))).unwrap();
    wait_done(&m, id);
    std::thread::sleep(Duration::from_millis(5));

    assert_eq!(block_on(m.expunge_expired()).unwrap(), 1);
    assert_eq!(store.job_count(), 0);
    m.shutdown();
}

#[test]
fn heartbeat_loop_wakes_expired_joins_on_its_own() {
    let (m, _store) = manager();
    let (dispatcher, gate) = gated(json!("x"));
    m.register_dispatcher("gated", dispatcher);
    register_parent(&m, Duration::from_millis(50));
    block_on(m.start()).unwrap();

    let parent = block_on(m.submit_async_job(AsyncJob::new("parent", "c", "{}"))).unwrap();
    let job = wait_done(&m, parent);
    assert_eq!(job.result_value().unwrap()["reason"], json!("timeout"));

    gate.close();
    m.shutdown();
}

struct Pools;

#[async_trait::async_trait]
impl crate::endpoint::LocalResource for Pools {
    async fn execute(&self, cmd: &agent_commands::Command) -> agent_commands::Answer {
        match &cmd.body {
            agent_commands::CommandBody::DeleteStoragePool { pool_uuid } if pool_uuid == "p-1" => {
                agent_commands::Answer::success_with("deleted", json!({"pool": pool_uuid}))
            }
            _ => agent_commands::Answer::failure("pool not found"),
        }
    }
}

#[test]
fn endpoint_dispatcher_maps_answers_to_outcomes() {
    use crate::endpoint::{HostAddress, LocalEndPoint};
    use agent_commands::{Command, CommandBody};

    let (m, _store) = manager();
    let endpoint = LocalEndPoint::new(HostAddress::new(3, "10.0.0.3"), Arc::new(Pools), m.callbacks());
    m.register_dispatcher("agent-command", Arc::new(EndPointDispatcher::new(Arc::new(endpoint))));

    let submit = |pool: &str| {
        let cmd = Command::new(CommandBody::DeleteStoragePool {
            pool_uuid: pool.to_string(),
        });
        let job = AsyncJob::for_command("agent-command", cmd.name(), &cmd).unwrap();
        block_on(m.submit_async_job(job)).unwrap()
    };
    let (found, missing) = (submit("p-1"), submit("p-2"));

    let job = wait_done(&m, found);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result_value().unwrap()["payload"]["pool"], json!("p-1"));

    let job = wait_done(&m, missing);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_code, result_code::RESOURCE_UNAVAILABLE);
    let journal = block_on(m.list_journal(missing)).unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[1].text, "pool not found");
    m.shutdown();
}
