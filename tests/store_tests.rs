use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pr_simulator::db::Database;
use pr_simulator::error::SimError;
use pr_simulator::job::{
    FailureStage, InMemoryJobStore, JobStatus, JobStore, PullRequestRef, Report, SimulationJob,
    UpdateOutcome,
};

fn backends(max_update_attempts: u32) -> Vec<(&'static str, Arc<dyn JobStore>)> {
    let db = Database::open_in_memory().unwrap();
    vec![
        (
            "memory",
            Arc::new(InMemoryJobStore::with_update_attempts(max_update_attempts)) as Arc<dyn JobStore>,
        ),
        ("sqlite", Arc::new(db.job_store(max_update_attempts)) as Arc<dyn JobStore>),
    ]
}

fn new_job(user_id: &str, number: u64) -> SimulationJob {
    let pr_url = format!("https://github.com/acme/shop/pull/{}", number);
    let pull_request = PullRequestRef::parse(&pr_url).unwrap();
    SimulationJob::new(user_id, pr_url, pull_request)
}

fn claim(job: &SimulationJob) -> Option<SimulationJob> {
    Some(job.claimed())
}

#[tokio::test]
async fn test_create_and_get() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        let stored = store.get(job.job_id).await.unwrap();
        assert_eq!(stored, job, "{}", name);
        assert_eq!(stored.status, JobStatus::Pending, "{}", name);
        assert_eq!(stored.version, 0, "{}", name);
    }
}

#[tokio::test]
async fn test_create_duplicate_is_conflict() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();
        assert!(
            matches!(store.create(job).await, Err(SimError::Conflict(_))),
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_get_unknown_is_not_found() {
    for (name, store) in backends(8) {
        let missing = uuid::Uuid::new_v4();
        assert!(
            matches!(store.get(missing).await, Err(SimError::NotFound(id)) if id == missing),
            "{}",
            name
        );
        assert!(
            matches!(store.update(missing, &claim).await, Err(SimError::NotFound(_))),
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_update_claims_and_bumps_version() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        let outcome = store.update(job.job_id, &claim).await.unwrap();
        assert!(outcome.was_updated(), "{}", name);
        let updated = outcome.into_job();
        assert_eq!(updated.status, JobStatus::Running, "{}", name);
        assert_eq!(updated.attempt_count, 1, "{}", name);
        assert_eq!(updated.version, 1, "{}", name);
        assert!(updated.updated_at >= job.updated_at, "{}", name);
        assert_eq!(store.get(job.job_id).await.unwrap(), updated, "{}", name);
    }
}

#[tokio::test]
async fn test_declined_update_writes_nothing() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        let outcome = store.update(job.job_id, &|_| None).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Unchanged(_)), "{}", name);
        assert_eq!(store.get(job.job_id).await.unwrap().version, 0, "{}", name);
    }
}

#[tokio::test]
async fn test_terminal_records_are_immutable() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();
        store.update(job.job_id, &claim).await.unwrap();

        let finish = |current: &SimulationJob| {
            Some(current.finished(JobStatus::Completed, Report::from_steps(Vec::new())))
        };
        let completed = store.update(job.job_id, &finish).await.unwrap().into_job();
        let completed_at = completed.completed_at.expect("completed_at set");

        for next in [JobStatus::Running, JobStatus::Failed] {
            let rewrite = |current: &SimulationJob| {
                let mut next_job = current.claimed();
                next_job.status = next;
                if next.is_terminal() {
                    next_job.report = Some(Report::failure(FailureStage::Execution, "late"));
                }
                Some(next_job)
            };
            assert!(
                matches!(
                    store.update(job.job_id, &rewrite).await,
                    Err(SimError::InvalidTransition { .. })
                ),
                "{}: completed -> {}",
                name,
                next
            );
        }

        let stored = store.get(job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed, "{}", name);
        assert_eq!(stored.completed_at, Some(completed_at), "{}", name);
        assert_eq!(stored.version, completed.version, "{}", name);
    }
}

#[tokio::test]
async fn test_pending_cannot_complete_without_running() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        let skip = |current: &SimulationJob| {
            Some(current.finished(JobStatus::Completed, Report::from_steps(Vec::new())))
        };
        assert!(
            matches!(
                store.update(job.job_id, &skip).await,
                Err(SimError::InvalidTransition { .. })
            ),
            "{}",
            name
        );

        // failing straight from pending is allowed
        let fail = |current: &SimulationJob| {
            Some(current.finished(JobStatus::Failed, Report::failure(None, "gave up")))
        };
        let failed = store.update(job.job_id, &fail).await.unwrap().into_job();
        assert_eq!(failed.status, JobStatus::Failed, "{}", name);
        assert!(failed.completed_at.is_some(), "{}", name);
    }
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();
        store.update(job.job_id, &claim).await.unwrap();

        assert!(
            matches!(
                store.compare_and_swap(0, job.claimed()).await,
                Err(SimError::ConcurrentModification(_))
            ),
            "{}",
            name
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_not_lost() {
    for (name, store) in backends(64) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let job_id = job.job_id;
            tasks.push(tokio::spawn(async move { store.update(job_id, &claim).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.get(job.job_id).await.unwrap();
        assert_eq!(stored.attempt_count, 10, "{}", name);
        assert_eq!(stored.version, 10, "{}", name);
    }
}

#[tokio::test]
async fn test_list_by_status_honours_cutoff() {
    for (name, store) in backends(8) {
        let old = new_job("alice", 1);
        store.create(old.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = new_job("alice", 2);
        store.create(fresh.clone()).await.unwrap();
        store.update(fresh.job_id, &claim).await.unwrap();
        let fresh_pending = new_job("bob", 3);
        store.create(fresh_pending.clone()).await.unwrap();

        let stale: Vec<_> = store
            .list_by_status(JobStatus::Pending, Some(cutoff))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(stale, vec![old.job_id], "{}", name);

        let pending = store.list_by_status(JobStatus::Pending, None).await.unwrap();
        assert_eq!(pending.len(), 2, "{}", name);
        let running = store.list_by_status(JobStatus::Running, None).await.unwrap();
        assert_eq!(running.len(), 1, "{}", name);
        assert_eq!(running[0].job_id, fresh.job_id, "{}", name);
    }
}

#[tokio::test]
async fn test_list_for_user_is_newest_first_and_limited() {
    for (name, store) in backends(8) {
        let mut ids = Vec::new();
        for n in 1..=4 {
            let job = new_job("alice", n);
            ids.push(job.job_id);
            store.create(job).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        store.create(new_job("bob", 9)).await.unwrap();

        let listed: Vec<_> = store
            .list_for_user("alice", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(listed, vec![ids[3], ids[2], ids[1]], "{}", name);
        assert!(store.list_for_user("carol", 10).await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("jobs.db");
    let job = new_job("alice", 5);

    {
        let store = Database::open(&path).unwrap().job_store(8);
        store.create(job.clone()).await.unwrap();
        store.update(job.job_id, &claim).await.unwrap();
    }

    let store = Database::open(&path).unwrap().job_store(8);
    let stored = store.get(job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.pull_request.number, 5);
}

#[tokio::test]
async fn test_update_with_borrowing_mutator_returns_current_record() {
    for (name, store) in backends(8) {
        let job = new_job("alice", 1);
        store.create(job.clone()).await.unwrap();

        // the mutator borrows local state and inspects the record it is given
        let wanted = JobStatus::Running;
        let only_if_running = |current: &SimulationJob| {
            (current.status == wanted)
                .then(|| current.finished(JobStatus::Failed, Report::failure(None, "stop")))
        };
        let outcome = store.update(job.job_id, &only_if_running).await.unwrap();
        assert!(!outcome.was_updated(), "{}", name);
        assert_eq!(outcome.into_job(), job, "{}", name);

        store.update(job.job_id, &claim).await.unwrap();
        let failed = store.update(job.job_id, &only_if_running).await.unwrap().into_job();
        assert_eq!(failed.status, JobStatus::Failed, "{}", name);
    }
}
