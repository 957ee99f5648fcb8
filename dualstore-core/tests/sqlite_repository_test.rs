//! Publish pipeline over the SQLite backend

mod common;

use bytes::Bytes;
use common::Fixture;
use dualstore_core::{
    Backends, Property, PublishBatch, RelationKind, ResourceState, SqliteBackend, TreeKind,
};
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_backends(dir: &TempDir) -> Backends {
    Backends::from_backend(Arc::new(SqliteBackend::open(dir.path()).unwrap()))
}

#[tokio::test]
async fn test_publish_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let file_id;
    {
        let fx = Fixture::with_backends(sqlite_backends(&temp_dir)).await;
        fx.store.create_folder("/docs").await.unwrap();
        file_id = fx.file("/docs/readme.txt", b"first").await.structure_id();
        fx.store.create_sibling("/docs/readme.txt", "/index.txt").await.unwrap();
        fx.store
            .write_properties("/docs/readme.txt", &[Property::shared("Title", "Readme")])
            .await
            .unwrap();
        fx.store
            .add_relation("/index.txt", "/docs/readme.txt", RelationKind::Link)
            .await
            .unwrap();
        let summary = fx.publish_all().await;
        assert_eq!(summary.published(), 3);
        assert_eq!(summary.failed(), 0);

        fx.store.move_resource("/docs", "/manual").await.unwrap();
        let summary = fx.publish_all().await;
        assert_eq!(summary.failed(), 0);
        fx.assert_consistent().await;
    }

    // a second open sees everything the first one published
    let fx = Fixture::with_backends(sqlite_backends(&temp_dir)).await;
    let live = fx.live("/manual/readme.txt").await.unwrap();
    assert_eq!(live.structure_id(), file_id);
    assert_eq!(live.sibling_count(), 2);
    assert_eq!(live.state(), ResourceState::Unchanged);
    assert!(fx.live("/docs/readme.txt").await.is_none());
    assert_eq!(
        fx.store.read_file(TreeKind::Live, "/index.txt").await.unwrap(),
        Bytes::from_static(b"first")
    );
    let props = fx
        .store
        .read_properties(TreeKind::Live, "/manual/readme.txt")
        .await
        .unwrap();
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].value(), Some("Readme"));

    let edges = fx.store.read_relations(TreeKind::Live, "/index.txt").await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target_id, file_id);
    assert_eq!(edges[0].target_path, "/manual/readme.txt");

    let runs = fx.store.backends().history.read_runs().await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs[0].publish_tag < runs[1].publish_tag);
    assert!(PublishBatch::collect(&fx.store, "/", common::USER)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_publish_clears_live_rows() {
    let temp_dir = TempDir::new().unwrap();
    let fx = Fixture::with_backends(sqlite_backends(&temp_dir)).await;
    let file = fx.file("/gone.txt", b"bye").await;
    fx.publish_all().await;
    fx.store.delete_resource("/gone.txt").await.unwrap();
    let summary = fx.publish_all().await;
    assert_eq!(summary.published(), 1);

    let entries = &fx.store.backends().entries;
    assert!(entries
        .read_structure(TreeKind::Live, file.structure_id())
        .await
        .unwrap()
        .is_none());
    assert!(entries
        .read_content(TreeKind::Live, file.content_id())
        .await
        .unwrap()
        .is_none());
    assert!(!fx.store.exists(TreeKind::Draft, "/gone.txt").await.unwrap());
    let history = fx
        .store
        .backends()
        .history
        .read_snapshots(file.structure_id())
        .await
        .unwrap();
    assert_eq!(history.last().unwrap().state, ResourceState::Deleted);
    fx.assert_consistent().await;
}
