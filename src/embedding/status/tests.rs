use super::*;
use tempfile::TempDir;

#[tokio::test]
async fn status_is_tracked_per_library_and_model() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = EmbeddingStatusStore::open(&dir.path().join("status.db"))
        .await
        .expect("should open store");

    assert!(store
        .get_embedding_status("payroll", "mini")
        .await
        .expect("should read")
        .is_none());

    store
        .new_embedding_status("payroll", "mini", 5)
        .await
        .expect("should start");
    store
        .increment_embedding_status("payroll", "mini", 2)
        .await
        .expect("should increment");
    store
        .increment_embedding_status("payroll", "mini", 3)
        .await
        .expect("should increment");
    store
        .new_embedding_status("payroll", "large", 9)
        .await
        .expect("should start");

    let status = store
        .get_embedding_status("payroll", "mini")
        .await
        .expect("should read")
        .expect("status exists");
    assert_eq!(status.total, 5);
    assert_eq!(status.processed, 5);
    assert!(status.is_complete());
    assert_eq!(store.list("payroll").await.expect("should list").len(), 2);
}

#[tokio::test]
async fn restarting_a_job_resets_progress() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = dir.path().join("status.db");
    let store = EmbeddingStatusStore::open(&path).await.expect("should open store");
    store.new_embedding_status("lib", "m", 4).await.expect("should start");
    store
        .increment_embedding_status("lib", "m", 4)
        .await
        .expect("should increment");
    store.new_embedding_status("lib", "m", 1).await.expect("should restart");

    // a second handle sees the same rows, as a polling process would
    let observer = EmbeddingStatusStore::open(&path).await.expect("should reopen store");
    let status = observer
        .get_embedding_status("lib", "m")
        .await
        .expect("should read")
        .expect("status exists");
    assert_eq!((status.total, status.processed), (1, 0));
}

#[tokio::test]
async fn incrementing_an_unknown_job_fails() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = EmbeddingStatusStore::open(&dir.path().join("status.db"))
        .await
        .expect("should open store");
    assert!(store.increment_embedding_status("lib", "m", 1).await.is_err());
}
