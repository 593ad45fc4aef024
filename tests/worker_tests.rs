
use std::sync::Arc;
use std::time::Duration;

use pr_simulator::collaborator::{ChangeKind, Diff, FileChange, TestPlan};
use pr_simulator::config::QueueConfig;
use pr_simulator::job::{FailureStage, JobStatus, JobStore, StepStatus, Verdict};
use pr_simulator::queue::JobQueue;
use pr_simulator::worker::{Disposition, WorkerPool};
use test_harness::{
    assert_eventually, fatal, plan, retryable, sample_diff, Execution, ScriptedCheckout,
    ScriptedExecutor, ScriptedPlanner, TestEnv, PR_URL, USER,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn test_all_steps_pass_completes_with_pass() {
    let env = TestEnv::happy();
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();
    let worker = env.worker();

    let message = env.next_message().await;
    let disposition = worker.handle(&message).await.unwrap();
    assert_eq!(disposition, Disposition::Acknowledged);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.completed_at.is_some());

    let report = stored.report.unwrap();
    assert_eq!(report.result, Verdict::Pass);
    assert_eq!(report.steps.len(), 3);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Pass));
    assert_eq!(report.head_sha.as_deref(), Some("0123abcd"));
    let stats = report.diff_stats.unwrap();
    assert_eq!(stats.files_changed, 1);
    assert_eq!(stats.lines_added, 2);
    assert_eq!(stats.lines_removed, 1);

    // message is gone and the workspace was released
    assert_eq!(env.queue.stats().await.unwrap().visible, 0);
    assert_eq!(env.queue.stats().await.unwrap().in_flight, 0);
    assert_eq!(env.checkout.released(), 1);
}

#[tokio::test]
async fn test_failing_step_completes_with_fail_and_runs_every_step() {
    let env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(3)),
        ScriptedExecutor::new().then(Execution::FailSteps(vec![2])),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let message = env.next_message().await;
    env.worker().handle(&message).await.unwrap();

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    let report = stored.report.unwrap();
    assert_eq!(report.result, Verdict::Fail);
    assert_eq!(report.summary, "2 of 3 steps passed");

    let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Pass, StepStatus::Fail, StepStatus::Pass]);
    assert_eq!(report.steps[1].detail.as_deref(), Some("assertion failed"));
    assert_eq!(env.executor.steps_seen.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_checkout_fails_without_planning_or_executing() {
    let env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()).then(Err(fatal("pull request not found"))),
        ScriptedPlanner::new(plan(3)),
        ScriptedExecutor::new(),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let message = env.next_message().await;
    let disposition = env.worker().handle(&message).await.unwrap();
    assert_eq!(disposition, Disposition::Acknowledged);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let report = stored.report.unwrap();
    assert_eq!(report.result, Verdict::Fail);
    assert_eq!(report.failure_stage, Some(FailureStage::Checkout));
    assert!(report.summary.contains("checkout"));
    assert!(report.summary.contains("pull request not found"));

    assert_eq!(env.checkout.calls(), 1);
    assert_eq!(env.planner.calls(), 0);
    assert_eq!(env.executor.calls(), 0);
    // nothing was checked out, nothing to release
    assert_eq!(env.checkout.released(), 0);
}

#[tokio::test]
async fn test_retryable_execution_is_redelivered_until_success() {
    let env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(2)),
        ScriptedExecutor::new()
            .then(Execution::Error(retryable("browser crashed")))
            .then(Execution::Error(retryable("browser crashed"))),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();
    let worker = env.worker();

    for delivery in 1..=2 {
        let message = env.next_message().await;
        assert_eq!(message.delivery_count, delivery);
        assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Released);

        let stored = env.store.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.last_error.as_deref(), Some("execution: browser crashed"));
    }

    let message = env.next_message().await;
    assert_eq!(message.delivery_count, 3);
    assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Acknowledged);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(stored.report.unwrap().result, Verdict::Pass);
    assert_eq!(env.checkout.calls(), 3);
    assert_eq!(env.checkout.released(), 3);
}

#[tokio::test]
async fn test_execution_timeout_is_retryable() {
    let mut env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(1)),
        ScriptedExecutor::new().then(Execution::Hang).then(Execution::Hang),
    );
    env.worker_config.execution_timeout_ms = 50;
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();
    let worker = env.worker();

    for _ in 0..2 {
        let message = env.next_message().await;
        assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Released);
    }
    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(
        stored.last_error.as_deref(),
        Some("execution: execution timed out after 50ms")
    );

    let message = env.next_message().await;
    assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Acknowledged);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 3);
    // the hung executions still released their workspaces
    assert_eq!(env.checkout.released(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_fails_the_job() {
    let env = TestEnv::with_queue(
        QueueConfig {
            visibility_timeout_ms: 5_000,
            max_deliveries: 2,
        },
        ScriptedCheckout::new(sample_diff())
            .then(Err(retryable("rate limited")))
            .then(Err(retryable("rate limited"))),
        ScriptedPlanner::new(plan(1)),
        ScriptedExecutor::new(),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();
    let worker = env.worker();

    let message = env.next_message().await;
    assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Released);

    let message = env.next_message().await;
    assert_eq!(message.delivery_count, 2);
    assert_eq!(worker.handle(&message).await.unwrap(), Disposition::Acknowledged);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let report = stored.report.unwrap();
    assert_eq!(report.failure_stage, Some(FailureStage::Checkout));
    assert_eq!(report.summary, "checkout failed after 2 attempts: rate limited");
    assert_eq!(env.planner.calls(), 0);
    assert_eq!(env.queue.stats().await.unwrap().dead_lettered, 0);
}

#[tokio::test]
async fn test_terminal_job_is_discarded_without_collaborator_calls() {
    let env = TestEnv::happy();
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();
    let worker = env.worker();

    let message = env.next_message().await;
    worker.handle(&message).await.unwrap();
    let completed = env.store.get(job.job_id).await.unwrap();

    // a duplicate message for the same job
    env.queue.enqueue(job.job_id).await.unwrap();
    let duplicate = env.next_message().await;
    assert_eq!(worker.handle(&duplicate).await.unwrap(), Disposition::Discarded);

    assert_eq!(env.checkout.calls(), 1);
    assert_eq!(env.planner.calls(), 1);
    assert_eq!(env.executor.calls(), 1);

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored, completed);
    assert_eq!(env.queue.stats().await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_message_for_unknown_job_is_discarded() {
    let env = TestEnv::happy();
    env.queue.enqueue(Uuid::new_v4()).await.unwrap();

    let message = env.next_message().await;
    assert_eq!(env.worker().handle(&message).await.unwrap(), Disposition::Discarded);
    assert_eq!(env.checkout.calls(), 0);
    assert_eq!(env.queue.stats().await.unwrap().visible, 0);
}

#[tokio::test]
async fn test_empty_diff_completes_with_pass() {
    let env = TestEnv::new(
        ScriptedCheckout::new(Diff::new("main", "docs", Vec::new())),
        ScriptedPlanner::new(plan(3)),
        ScriptedExecutor::new(),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let message = env.next_message().await;
    env.worker().handle(&message).await.unwrap();

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    let report = stored.report.unwrap();
    assert_eq!(report.result, Verdict::Pass);
    assert_eq!(report.summary, "no testable changes");
    assert!(report.steps.is_empty());
    assert_eq!(env.planner.calls(), 0);
    assert_eq!(env.executor.calls(), 0);
}

#[tokio::test]
async fn test_empty_plan_fails_in_plan_generation() {
    let env = TestEnv::new(
        ScriptedCheckout::new(Diff::new(
            "main",
            "readme",
            vec![FileChange::new("README.md", ChangeKind::Modified)],
        )),
        ScriptedPlanner::new(TestPlan::default()),
        ScriptedExecutor::new(),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let message = env.next_message().await;
    env.worker().handle(&message).await.unwrap();

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let report = stored.report.unwrap();
    assert_eq!(report.failure_stage, Some(FailureStage::PlanGeneration));
    assert!(report.summary.starts_with("plan generation failed"));
    assert_eq!(env.executor.calls(), 0);
    assert_eq!(env.checkout.released(), 1);
}

#[tokio::test]
async fn test_fatal_plan_generation_fails_the_job() {
    let env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(1)).then(Err(fatal("diff too large"))),
        ScriptedExecutor::new(),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let message = env.next_message().await;
    env.worker().handle(&message).await.unwrap();

    let report = env.store.get(job.job_id).await.unwrap().report.unwrap();
    assert_eq!(report.summary, "plan generation failed: diff too large");
    assert_eq!(env.executor.calls(), 0);
}

#[tokio::test]
async fn test_worker_pool_processes_submissions_and_drains_on_shutdown() {
    let env = TestEnv::happy();
    let gateway = env.gateway();
    let mut ids = Vec::new();
    for n in 1..=4 {
        let job = gateway
            .submit(USER, &format!("https://github.com/acme/shop/pull/{}", n))
            .await
            .unwrap();
        ids.push(job.job_id);
    }

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(Arc::new(env.worker()), env.worker_config.clone());
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    let store = env.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            let ids = ids.clone();
            async move {
                for id in ids {
                    if store.get(id).await.unwrap().status != JobStatus::Completed {
                        return false;
                    }
                }
                true
            }
        },
        Duration::from_secs(5),
        "all submitted jobs complete",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), pool_task)
        .await
        .expect("pool should stop after shutdown")
        .unwrap();
    assert_eq!(env.checkout.calls(), 4);
}

#[tokio::test]
async fn test_slow_job_is_not_redelivered_while_a_worker_holds_it() {
    let env = TestEnv::with_queue(
        QueueConfig {
            visibility_timeout_ms: 100,
            max_deliveries: 3,
        },
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(2)),
        ScriptedExecutor::new().then(Execution::Slow(Duration::from_millis(400))),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(Arc::new(env.worker()), env.worker_config.clone());
    assert!(env.worker_config.worker_count >= 2);
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    let store = env.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.get(job.job_id).await.unwrap().is_terminal() }
        },
        Duration::from_secs(3),
        "slow job finishes",
    )
    .await;
    // give an idle worker the chance to pick up a stray redelivery
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), pool_task)
        .await
        .expect("pool should stop after shutdown")
        .unwrap();

    let stored = env.store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(env.checkout.calls(), 1);
    assert_eq!(env.executor.calls(), 1);
    assert_eq!(env.executor.max_concurrent(), 1);
    assert_eq!(env.queue.stats().await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_message_stays_hidden_while_handled() {
    let env = TestEnv::with_queue(
        QueueConfig {
            visibility_timeout_ms: 60,
            max_deliveries: 3,
        },
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(1)),
        ScriptedExecutor::new().then(Execution::Slow(Duration::from_millis(300))),
    );
    env.gateway().submit(USER, PR_URL).await.unwrap();
    let message = env.next_message().await;

    let worker = env.worker();
    let handling = tokio::spawn(async move { worker.handle(&message).await });

    // several visibility timeouts pass while the executor is busy
    assert!(env.queue.dequeue(Duration::from_millis(250)).await.unwrap().is_none());

    assert_eq!(handling.await.unwrap().unwrap(), Disposition::Acknowledged);
    assert!(env.queue.dequeue(Duration::from_millis(100)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_releases_in_flight_message() {
    let env = TestEnv::new(
        ScriptedCheckout::new(sample_diff()),
        ScriptedPlanner::new(plan(1)),
        ScriptedExecutor::new().then(Execution::Hang),
    );
    let job = env.gateway().submit(USER, PR_URL).await.unwrap();

    let shutdown = CancellationToken::new();
    let mut config = env.worker_config.clone();
    config.worker_count = 1;
    let pool = WorkerPool::new(Arc::new(env.worker()), config);
    let pool_task = tokio::spawn(pool.run(shutdown.clone()));

    let executor = env.executor.clone();
    assert_eventually(
        || {
            let executor = executor.clone();
            async move { executor.calls() == 1 }
        },
        Duration::from_secs(2),
        "executor called",
    )
    .await;

    shutdown.cancel();
    pool_task.await.unwrap();

    // the message is visible again and the job is still running
    assert_eq!(env.queue.stats().await.unwrap().visible, 1);
    assert_eq!(env.store.get(job.job_id).await.unwrap().status, JobStatus::Running);

    // the abandoned workspace is released by its guard
    let checkout = env.checkout.clone();
    assert_eventually(
        || {
            let checkout = checkout.clone();
            async move { checkout.released() == 1 }
        },
        Duration::from_secs(1),
        "workspace released",
    )
    .await;
}
