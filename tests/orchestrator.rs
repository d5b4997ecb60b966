mod common;

use common::{Harness, settle_briefly, test_settings};
use manual_index::Error;
use manual_index::job::{IndexingStats, Job, JobMetrics, JobProgress, JobStage, JobStatus, JobStore};
use manual_index::orchestrator::ProgressUpdate;
use manual_index::storage::{BlobStore, MemoryBlobStore, job_key};

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn seed_job(blobs: &Arc<MemoryBlobStore>, job: &Job) {
    let store: Arc<dyn BlobStore> = blobs.clone();
    JobStore::new(store).save(job).await.expect("seed job");
}

#[tokio::test]
async fn start_indexing_triggers_worker_and_marks_job_indexing() {
    let harness = Harness::new().await;
    harness.register("f1").await;

    let job_id = harness
        .orchestrator
        .start_indexing("f1", "pump-manual.pdf", false)
        .await
        .expect("start");

    let job = harness.orchestrator.get_job(&job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Indexing);
    assert_eq!(job.stage, JobStage::IndexBuilding);
    assert_eq!(job.file_name, "pump-manual.pdf");

    let triggers = harness.worker.triggered();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].job_id, job_id);
    assert_eq!(triggers[0].storage_location, "uploads/f1.pdf");
    assert_eq!(
        triggers[0].callback_url,
        format!("http://orchestrator.test/api/jobs/{job_id}/callback")
    );

    let locks = harness.orchestrator.locks();
    assert_eq!(locks.global_holder(), Some(job_id.clone()));
    assert_eq!(locks.file_holder("f1"), Some(job_id.clone()));
    assert!(
        harness
            .blobs
            .get(&job_key(&job_id))
            .await
            .expect("get")
            .is_some(),
        "job persisted"
    );
}

#[tokio::test]
async fn duplicate_start_conflicts_and_force_rebuild_issues_new_job() {
    let harness = Harness::new().await;
    harness.register("f1").await;

    let first = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("first start");

    let duplicate = harness.orchestrator.start_indexing("f1", "doc.pdf", false).await;
    assert!(matches!(duplicate, Err(Error::LockConflict(_))));

    let forced = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", true)
        .await
        .expect("forced start");
    assert_ne!(forced, first);

    let locks = harness.orchestrator.locks();
    assert_eq!(locks.global_holder(), Some(forced.clone()));
    assert_eq!(locks.file_holder("f1"), Some(forced.clone()));

    // The superseded job's callback must not free the new job's locks.
    harness
        .orchestrator
        .update_job_from_callback(&first, true, None, None)
        .await
        .expect("stale callback");
    assert_eq!(locks.global_holder(), Some(forced.clone()));
    assert_eq!(locks.file_holder("f1"), Some(forced));
}

#[tokio::test]
async fn another_document_waits_for_the_global_lock() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    harness.register("f2").await;

    assert_ok!(harness.orchestrator.start_indexing("f1", "a.pdf", false).await);
    let blocked = harness.orchestrator.start_indexing("f2", "b.pdf", false).await;
    assert!(matches!(blocked, Err(Error::LockConflict(_))));
    assert!(!harness.orchestrator.locks().is_file_locked("f2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_for_one_file_admit_exactly_one() {
    let harness = Harness::new().await;
    harness.register("f1").await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move { orchestrator.start_indexing("f1", "doc.pdf", false).await })
        })
        .collect();

    let mut started = Vec::new();
    for outcome in futures::future::join_all(handles).await {
        match outcome.expect("task") {
            Ok(job_id) => started.push(job_id),
            Err(Error::LockConflict(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(started.len(), 1);
    assert_eq!(harness.worker.triggered().len(), 1);
    assert_eq!(
        harness.orchestrator.locks().file_holder("f1"),
        Some(started[0].clone())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_start_wins_against_concurrent_starts_for_other_files() {
    let harness = Harness::new().await;
    for file_id in ["f0", "f1", "f2", "f3", "f4", "f5"] {
        harness.register(file_id).await;
    }
    assert_ok!(harness.orchestrator.start_indexing("f0", "held.pdf", false).await);

    for _ in 0..50 {
        let contenders: Vec<_> = ["f2", "f3", "f4", "f5"]
            .into_iter()
            .map(|file_id| {
                let orchestrator = harness.orchestrator.clone();
                tokio::spawn(async move { orchestrator.start_indexing(file_id, "other.pdf", false).await })
            })
            .collect();
        let forced = {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move { orchestrator.start_indexing("f1", "doc.pdf", true).await })
        };

        let forced = forced.await.expect("task").expect("forced start acquires both locks");
        for outcome in futures::future::join_all(contenders).await {
            assert!(matches!(outcome.expect("task"), Err(Error::LockConflict(_))));
        }
        assert_eq!(harness.orchestrator.locks().file_holder("f1"), Some(forced));
    }
}

#[tokio::test]
async fn success_callback_completes_once() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start");

    let metrics = JobMetrics {
        processing_time: Some(120.0),
        num_chunks: Some(42),
        num_vectors: Some(42),
        stats: Some(IndexingStats {
            total_tokens: Some(10_000),
            ..IndexingStats::default()
        }),
    };
    let job = harness
        .orchestrator
        .update_job_from_callback(&job_id, true, None, Some(metrics))
        .await
        .expect("callback");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, JobStage::Completed);
    assert_eq!(job.progress, JobProgress::complete());
    assert!(job.completed_at.is_some());
    assert_eq!(job.num_vectors, Some(42));
    let costs = job.costs.clone().expect("costs");
    assert!((costs.total - (costs.worker + costs.embedding)).abs() < 1e-12);
    assert!(costs.worker > 0.0 && costs.embedding > 0.0);

    let locks = harness.orchestrator.locks();
    assert!(!locks.is_globally_locked());
    assert!(!locks.is_file_locked("f1"));

    // A repeat with a different outcome changes nothing.
    let repeat = harness
        .orchestrator
        .update_job_from_callback(&job_id, false, Some("late failure".into()), None)
        .await
        .expect("repeat callback");
    assert_eq!(repeat, job);
    assert_eq!(harness.orchestrator.get_job(&job_id).await.expect("job"), job);
}

#[tokio::test]
async fn failure_callback_records_error_and_frees_locks() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start");

    let job = harness
        .orchestrator
        .update_job_from_callback(&job_id, false, Some("pdf extraction failed".into()), None)
        .await
        .expect("callback");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("pdf extraction failed"));
    assert!(!harness.orchestrator.locks().is_globally_locked());

    // The file can be indexed again straight away.
    assert_ok!(harness.orchestrator.start_indexing("f1", "doc.pdf", false).await);
}

#[tokio::test]
async fn callback_for_unknown_job_is_not_found() {
    let harness = Harness::new().await;
    let result = harness
        .orchestrator
        .update_job_from_callback("missing", true, None, None)
        .await;
    assert!(matches!(result, Err(Error::NotFound { kind: "job", .. })));
}

#[tokio::test]
async fn trigger_failure_fails_job_but_returns_its_id() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    harness.worker.fail.store(true, Ordering::SeqCst);

    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start returns job id");

    let job = harness.orchestrator.get_job(&job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error
            .as_deref()
            .is_some_and(|error| error.contains("worker unavailable"))
    );
    assert!(!harness.orchestrator.locks().is_globally_locked());
    assert!(!harness.orchestrator.locks().is_file_locked("f1"));
}

#[tokio::test]
async fn unregistered_file_is_not_found_and_leaves_no_locks() {
    let harness = Harness::new().await;

    let result = harness.orchestrator.start_indexing("ghost", "ghost.pdf", false).await;
    assert!(matches!(result, Err(Error::NotFound { kind: "file", .. })));
    assert!(harness.worker.triggered().is_empty());
    assert!(!harness.orchestrator.locks().is_globally_locked());

    let jobs = harness.orchestrator.list_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn cancel_pending_job_then_again() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let pending = Job::new("job-pending", "f1", "doc.pdf");
    seed_job(&blobs, &pending).await;

    let harness = Harness::with_store(test_settings(), blobs).await;
    assert_eq!(harness.orchestrator.restore().await.expect("restore"), 1);
    assert_eq!(
        harness.orchestrator.locks().file_holder("f1").as_deref(),
        Some("job-pending")
    );

    assert!(harness.orchestrator.cancel_job("job-pending").await.expect("cancel"));
    assert!(!harness.orchestrator.cancel_job("job-pending").await.expect("cancel again"));
    assert!(!harness.orchestrator.cancel_job("never-existed").await.expect("cancel missing"));

    let job = harness.orchestrator.get_job("job-pending").await.expect("job");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!harness.orchestrator.locks().is_file_locked("f1"));
}

#[tokio::test]
async fn late_callback_after_cancel_is_ignored() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start");

    assert!(harness.orchestrator.cancel_job(&job_id).await.expect("cancel"));
    let job = harness
        .orchestrator
        .update_job_from_callback(&job_id, true, None, None)
        .await
        .expect("late callback");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.costs.is_none());
}

#[tokio::test]
async fn stalled_jobs_time_out_on_read() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let mut stalled = Job::new("job-stalled", "f1", "doc.pdf");
    stalled.status = JobStatus::Indexing;
    stalled.stage = JobStage::IndexBuilding;
    stalled.created_at = Utc::now() - TimeDelta::minutes(16);
    seed_job(&blobs, &stalled).await;

    let mut listed = Job::new("job-listed", "f2", "other.pdf");
    listed.status = JobStatus::Indexing;
    listed.created_at = Utc::now() - TimeDelta::minutes(20);
    seed_job(&blobs, &listed).await;

    let fresh = Job::new("job-fresh", "f3", "new.pdf");
    seed_job(&blobs, &fresh).await;

    let harness = Harness::with_store(test_settings(), blobs).await;
    harness.orchestrator.restore().await.expect("restore");
    assert!(harness.orchestrator.locks().is_file_locked("f1"));

    let job = harness.orchestrator.get_job("job-stalled").await.expect("job");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error
            .as_deref()
            .is_some_and(|error| error.contains("timed out after 15 minutes"))
    );
    assert!(!harness.orchestrator.locks().is_file_locked("f1"));

    let jobs = harness.orchestrator.list_jobs().await;
    let status_of = |id: &str| {
        jobs.iter()
            .find(|job| job.job_id == id)
            .map(|job| job.status)
            .expect("listed")
    };
    assert_eq!(status_of("job-listed"), JobStatus::Failed);
    assert_eq!(status_of("job-fresh"), JobStatus::Pending);
    assert!(!harness.orchestrator.locks().is_file_locked("f2"));

    // Timed out jobs are terminal; a late callback does not revive them.
    let job = harness
        .orchestrator
        .update_job_from_callback("job-stalled", true, None, None)
        .await
        .expect("late callback");
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn progress_updates_job_and_checkpoint_until_finished() {
    let harness = Harness::new().await;
    harness.register("f1").await;
    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start");

    let job = harness
        .orchestrator
        .record_progress(
            &job_id,
            ProgressUpdate {
                stage: JobStage::Embedding,
                current: 5,
                total: 10,
                processed_item_ids: vec!["chunk-0".into(), "chunk-1".into()],
                last_processed_index: None,
            },
        )
        .await
        .expect("progress");
    assert_eq!(job.stage, JobStage::Embedding);
    assert_eq!(job.progress.current, 5);
    assert_eq!(job.progress.percentage, 50.0);

    let checkpoint = harness
        .orchestrator
        .checkpoint(&job_id)
        .await
        .expect("load checkpoint")
        .expect("checkpoint saved");
    assert_eq!(checkpoint.stage, JobStage::Embedding);
    assert_eq!(checkpoint.processed_item_ids, vec!["chunk-0", "chunk-1"]);
    assert_eq!(checkpoint.last_processed_index, 4);

    harness
        .orchestrator
        .update_job_from_callback(&job_id, true, None, None)
        .await
        .expect("callback");
    assert!(
        harness
            .orchestrator
            .checkpoint(&job_id)
            .await
            .expect("load checkpoint")
            .is_none()
    );

    // Progress after completion is ignored.
    let job = harness
        .orchestrator
        .record_progress(
            &job_id,
            ProgressUpdate {
                stage: JobStage::Upload,
                current: 1,
                total: 1,
                processed_item_ids: Vec::new(),
                last_processed_index: None,
            },
        )
        .await
        .expect("progress after completion");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, JobProgress::complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_racing_completion_leaves_no_checkpoint() {
    let harness = Harness::new().await;
    harness.register("f1").await;

    for round in 0..30u64 {
        let job_id = harness
            .orchestrator
            .start_indexing("f1", "doc.pdf", false)
            .await
            .expect("start");

        let progress = {
            let orchestrator = harness.orchestrator.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .record_progress(
                        &job_id,
                        ProgressUpdate {
                            stage: JobStage::Embedding,
                            current: round % 10,
                            total: 10,
                            processed_item_ids: vec![format!("chunk-{round}")],
                            last_processed_index: None,
                        },
                    )
                    .await
            })
        };
        let callback = {
            let orchestrator = harness.orchestrator.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .update_job_from_callback(&job_id, true, None, None)
                    .await
            })
        };

        progress.await.expect("progress task").expect("progress");
        callback.await.expect("callback task").expect("callback");

        let job = harness.orchestrator.get_job(&job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(
            harness
                .orchestrator
                .checkpoint(&job_id)
                .await
                .expect("load checkpoint")
                .is_none(),
            "round {round} left a checkpoint behind"
        );
    }
}

#[tokio::test]
async fn restart_restores_jobs_from_the_store() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let job_id = {
        let harness = Harness::with_store(test_settings(), blobs.clone()).await;
        harness.register("f1").await;
        let job_id = harness
            .orchestrator
            .start_indexing("f1", "doc.pdf", false)
            .await
            .expect("start");
        harness
            .orchestrator
            .update_job_from_callback(&job_id, true, None, None)
            .await
            .expect("callback");
        job_id
    };

    let restarted = Harness::with_store(test_settings(), blobs).await;
    assert_eq!(restarted.orchestrator.restore().await.expect("restore"), 1);
    let job = restarted.orchestrator.get_job(&job_id).await.expect("job");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!restarted.orchestrator.locks().is_globally_locked());
}

#[tokio::test]
async fn cleanup_drops_finished_jobs_past_retention() {
    let mut settings = test_settings();
    settings.job_retention = Duration::ZERO;
    let harness = Harness::with_settings(settings).await;
    harness.register("f1").await;

    let job_id = harness
        .orchestrator
        .start_indexing("f1", "doc.pdf", false)
        .await
        .expect("start");
    harness
        .orchestrator
        .update_job_from_callback(&job_id, true, None, None)
        .await
        .expect("callback");
    settle_briefly().await;

    assert_eq!(harness.orchestrator.cleanup_old_jobs().await.expect("cleanup"), 1);
    assert_err!(harness.orchestrator.get_job(&job_id).await);
    assert!(
        harness
            .blobs
            .get(&job_key(&job_id))
            .await
            .expect("get")
            .is_none()
    );
}
