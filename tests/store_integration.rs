//! Integration tests for the store against an on-disk `SQLite` database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use segfetch_core::model::NewDownload;
use segfetch_core::{
    Database, DownloadModel, DownloadStatus, Segment, SegmentState, Store, StoreError,
};
use tempfile::TempDir;

async fn open(path: &Path) -> Store {
    Store::new(Database::new(path).await.expect("Failed to open database"))
}

fn new_download(name: &str, priority: i64) -> NewDownload {
    NewDownload {
        source_url: format!("https://cdn.example.com/{name}"),
        destination_path: PathBuf::from("/data").join(name),
        display_name: name.to_string(),
        priority,
        expected_size: Some(4000),
        expected_sha256: None,
    }
}

fn plan(model: &mut DownloadModel, parts: u64, size: u64) {
    let len = size / parts;
    model.total_size_bytes = Some(size);
    model.supports_range_requests = true;
    model.segments = (0..parts)
        .map(|i| {
            let index = u32::try_from(i).unwrap();
            Segment::new(
                index,
                i * len,
                Some((i + 1) * len),
                PathBuf::from(format!("/tmp/{}/seg-{index:04}", model.id)),
            )
        })
        .collect();
}

#[tokio::test]
async fn test_checkpoint_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");

    let id = {
        let store = open(&db_path).await;
        let mut model = store.create(&new_download("a.bin", 0)).await.unwrap();
        plan(&mut model, 4, 4000);
        model.status = DownloadStatus::Active;
        model.segments[0].bytes_written = 1000;
        model.segments[0].state = SegmentState::Done;
        model.segments[1].bytes_written = 250;
        model.segments[1].state = SegmentState::InProgress;
        model.attempt_count = 2;
        store.save(&model).await.unwrap();
        store.database().clone().close().await;
        model.id
    };

    let store = open(&db_path).await;
    let models = store.load_all().await.unwrap();
    assert_eq!(models.len(), 1);

    let model = &models[0];
    assert_eq!(model.id, id);
    assert_eq!(model.status, DownloadStatus::Queued);
    assert_eq!(model.attempt_count, 2);
    assert_eq!(model.bytes_written(), 1250);
    assert_eq!(model.segments[0].state, SegmentState::Done);
    assert_eq!(model.segments[1].state, SegmentState::Pending);
    assert_eq!(model.segments[1].bytes_written, 250);
    assert!(model.has_valid_coverage());
}

#[tokio::test]
async fn test_terminal_and_paused_statuses_are_not_requeued() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("state.db")).await;

    let mut statuses = Vec::new();
    for (name, status) in [
        ("paused.bin", DownloadStatus::Paused),
        ("done.bin", DownloadStatus::Completed),
        ("failed.bin", DownloadStatus::Failed),
        ("cancelled.bin", DownloadStatus::Cancelled),
        ("merging.bin", DownloadStatus::Merging),
    ] {
        let mut model = store.create(&new_download(name, 0)).await.unwrap();
        model.status = status;
        store.save(&model).await.unwrap();
        statuses.push(model.id);
    }

    let reloaded: Vec<DownloadStatus> = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.status)
        .collect();
    assert_eq!(
        reloaded,
        vec![
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
            DownloadStatus::Queued,
        ]
    );
}

#[tokio::test]
async fn test_concurrent_checkpoints_do_not_conflict() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir.path().join("state.db")).await);

    let mut ids = Vec::new();
    for i in 0..8 {
        let mut model = store
            .create(&new_download(&format!("f{i}.bin"), 0))
            .await
            .unwrap();
        plan(&mut model, 4, 4000);
        store.save(&model).await.unwrap();
        ids.push(model.id);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for id in ids.clone() {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            for step in 1..=10u64 {
                let mut model = store.load(id).await?.ok_or(StoreError::NotFound(id))?;
                for segment in &mut model.segments {
                    segment.bytes_written = step * 100;
                }
                store.save(&model).await?;
            }
            Ok::<_, StoreError>(())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    for id in ids {
        let model = store.load(id).await.unwrap().unwrap();
        assert_eq!(model.bytes_written(), 4000);
    }
}

#[tokio::test]
async fn test_delete_then_reopen_forgets_download() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");
    let store = open(&db_path).await;

    let mut keep = store.create(&new_download("keep.bin", 5)).await.unwrap();
    plan(&mut keep, 2, 4000);
    store.save(&keep).await.unwrap();
    let mut drop_me = store.create(&new_download("drop.bin", 1)).await.unwrap();
    plan(&mut drop_me, 2, 4000);
    store.save(&drop_me).await.unwrap();

    store.delete(drop_me.id).await.unwrap();
    assert!(matches!(
        store.delete(drop_me.id).await,
        Err(StoreError::NotFound(id)) if id == drop_me.id
    ));
    store.database().clone().close().await;

    let store = open(&db_path).await;
    let models = store.list_all().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, keep.id);
    assert_eq!(models[0].segments.len(), 2);
}
