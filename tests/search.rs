mod common;

use common::{Harness, axis, test_settings};
use manual_index::Error;
use manual_index::config::IndexKind;
use manual_index::error::{IndexError, InferenceError};
use manual_index::orchestrator::search::SearchRequest;
use manual_index::storage::{BlobStore, index_blob_key};

use std::sync::atomic::Ordering;

fn request(file_id: &str, query: &str, k: usize, min_score: f32) -> SearchRequest {
    SearchRequest {
        file_id: file_id.into(),
        query: query.into(),
        k: Some(k),
        min_score: Some(min_score),
    }
}

#[tokio::test]
async fn search_vector_ranks_and_maps_metadata() {
    let harness = Harness::new().await;
    harness
        .publish("f1", &[axis(0, 0.0), axis(1, 0.0), axis(0, 0.5), axis(2, 0.0)])
        .await;
    harness.embedder.set("impeller torque", axis(0, 0.0));

    let results = harness
        .orchestrator
        .search_vector(&request("f1", "impeller torque", 2, 0.0))
        .await
        .expect("search");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk_id, "f1-chunk-0");
    assert_eq!(results[1].chunk_id, "f1-chunk-2");
    assert!(results[0].score >= results[1].score);
    assert_eq!(results[1].metadata.vector_id, 2);
    assert_eq!(results[1].content, "f1 section 2");
    assert!(harness.scratch_is_empty());
}

#[tokio::test]
async fn search_vector_never_returns_scores_below_threshold() {
    let harness = Harness::new().await;
    harness
        .publish("f1", &[axis(0, 0.0), axis(1, 0.0), axis(0, 1.0), axis(3, 0.0)])
        .await;
    harness.embedder.set("q", axis(0, 0.0));

    for min_score in [0.0, 0.5, 0.75, 0.99] {
        let results = harness
            .orchestrator
            .search_vector(&request("f1", "q", 10, min_score))
            .await
            .expect("search");
        assert!(results.iter().all(|result| result.score >= min_score));
    }

    let strict = harness
        .orchestrator
        .search_vector(&request("f1", "q", 10, 0.99))
        .await
        .expect("search");
    assert_eq!(strict.len(), 1);
}

#[tokio::test]
async fn k_larger_than_index_is_clamped() {
    let harness = Harness::new().await;
    harness.publish("f1", &[axis(0, 0.0), axis(1, 0.0)]).await;

    let results = harness
        .orchestrator
        .search_vector(&request("f1", "anything", 50, -1.0))
        .await
        .expect("search");
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn missing_artifacts_fail_with_index_load_and_leave_no_temp_files() {
    let harness = Harness::new().await;

    let missing = harness
        .orchestrator
        .search_vector(&request("absent", "q", 5, 0.0))
        .await;
    assert!(matches!(
        missing,
        Err(Error::IndexLoad { ref file_id, source: IndexError::MissingArtifact(_) }) if file_id == "absent"
    ));

    harness.publish("broken", &[axis(0, 0.0)]).await;
    harness
        .blobs
        .put(&index_blob_key("broken"), b"not a gzip stream".to_vec())
        .await
        .expect("corrupt blob");
    let corrupt = harness
        .orchestrator
        .search_vector(&request("broken", "q", 5, 0.0))
        .await;
    assert!(matches!(
        corrupt,
        Err(Error::IndexLoad { source: IndexError::Corrupt(_), .. })
    ));
    assert!(harness.scratch_is_empty());
    assert_eq!(
        harness
            .embedder
            .calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn search_all_merges_documents_by_score() {
    let harness = Harness::new().await;
    harness
        .publish("f1", &[axis(0, 0.0), axis(0, 0.2), axis(1, 0.0)])
        .await;
    harness
        .publish("f2", &[axis(0, 0.1), axis(2, 0.0), axis(0, 0.6)])
        .await;
    // Blob without metadata: not a completed index.
    harness
        .blobs
        .put(&index_blob_key("half"), vec![0])
        .await
        .expect("put");
    harness.embedder.set("q", axis(0, 0.0));

    let results = harness
        .orchestrator
        .search_all_manuals("q", Some(3), Some(0.5))
        .await
        .expect("search all");

    assert_eq!(results.len(), 3);
    assert!(
        results
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score)
    );
    assert!(results.iter().all(|result| result.score >= 0.5));
    assert!(results.iter().all(|result| result.file_id != "half"));
    assert_eq!(results[0].chunk_id, "f1-chunk-0");
    assert!(results.iter().any(|result| result.file_id == "f2"));
    assert!(harness.scratch_is_empty());
}

#[tokio::test]
async fn search_all_skips_broken_documents() {
    let harness = Harness::new().await;
    harness.publish("good", &[axis(0, 0.0)]).await;
    harness.publish("bad", &[axis(0, 0.0)]).await;
    harness
        .blobs
        .put(&index_blob_key("bad"), b"garbage".to_vec())
        .await
        .expect("corrupt");
    harness.embedder.set("q", axis(0, 0.0));

    let results = harness
        .orchestrator
        .search_all_manuals("q", Some(5), None)
        .await
        .expect("search all");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file_id, "good");
}

#[tokio::test]
async fn search_all_without_indexes_is_empty() {
    let harness = Harness::new().await;
    let results = harness
        .orchestrator
        .search_all_manuals("q", None, None)
        .await
        .expect("search all");
    assert!(results.is_empty());
}

#[tokio::test]
async fn hnsw_kind_serves_flat_blobs() {
    let mut settings = test_settings();
    settings.search.index_kind = IndexKind::Hnsw;
    let harness = Harness::with_settings(settings).await;
    harness
        .publish("f1", &[axis(0, 0.0), axis(1, 0.0), axis(2, 0.0), axis(3, 0.0)])
        .await;
    harness.embedder.set("q", axis(2, 0.0));

    let results = harness
        .orchestrator
        .search_vector(&request("f1", "q", 1, 0.0))
        .await
        .expect("search");
    assert_eq!(results[0].chunk_id, "f1-chunk-2");
}

#[tokio::test]
async fn embedding_failure_after_load_removes_temp_file() {
    let harness = Harness::new().await;
    harness.publish("f1", &[axis(0, 0.0), axis(1, 0.0)]).await;
    harness.embedder.fail.store(true, Ordering::SeqCst);

    let result = harness
        .orchestrator
        .search_vector(&request("f1", "impeller torque", 2, 0.0))
        .await;

    assert!(matches!(
        result,
        Err(Error::Inference(InferenceError::Fatal(_)))
    ));
    assert_eq!(harness.embedder.calls.load(Ordering::SeqCst), 1);
    assert!(harness.scratch_is_empty());
}
