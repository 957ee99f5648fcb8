//! End-to-end publish scenarios over the in-memory backend

mod common;

use bytes::Bytes;
use common::{Failure, FailingEntries, Fixture};
use std::sync::atomic::Ordering;
use dualstore_core::{
    ItemStatus, Notification, Property, PublishAction, PublishBatch, RelationKind, RepoError,
    RepositoryConfig, ResourceState, TreeKind,
};

#[tokio::test]
async fn test_publish_new_file() {
    let fx = Fixture::new().await;
    let created = fx.file("/f.txt", b"hello").await;
    assert_eq!(created.state(), ResourceState::New);
    assert_eq!(created.content.version, 0);

    let summary = fx.publish_all().await;
    assert_eq!(summary.published(), 1);
    assert_eq!(
        summary.outcome(created.structure_id()).unwrap().status,
        ItemStatus::Published(PublishAction::New)
    );

    let draft = fx.draft("/f.txt").await;
    assert_eq!(draft.state(), ResourceState::Unchanged);
    assert_eq!(draft.content.version, 1);
    assert_eq!(draft.structure.version, 0);

    let live = fx.live("/f.txt").await.unwrap();
    assert_eq!(live.structure_id(), created.structure_id());
    assert_eq!(live.content.version, 1);
    assert_eq!(live.sibling_count(), 1);
    assert_eq!(
        fx.store.read_file(TreeKind::Live, "/f.txt").await.unwrap(),
        Bytes::from_static(b"hello")
    );

    let history = fx.store.read_history("/f.txt").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, ResourceState::New);
    assert_eq!(history[0].publish_tag, summary.publish_tag);
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_edited_sibling_bumps_shared_content_once() {
    let fx = Fixture::new().await;
    fx.file("/a.txt", b"v1").await;
    fx.store.create_sibling("/a.txt", "/b.txt").await.unwrap();
    let first = fx.publish_all().await;
    assert_eq!(first.published(), 2);
    let content_id = fx.draft("/a.txt").await.content_id();
    assert_eq!(fx.draft("/b.txt").await.content_id(), content_id);
    assert_eq!(fx.draft("/a.txt").await.content.version, 1);

    fx.store
        .write_file("/a.txt", Bytes::from_static(b"v2"))
        .await
        .unwrap();
    let second = fx.publish_files(&["/a.txt"]).await;
    assert_eq!(second.published(), 1);

    let draft = fx.draft("/a.txt").await;
    let live = fx.live("/a.txt").await.unwrap();
    assert_eq!(draft.content.version, 2);
    assert_eq!(live.content.version, 2);
    assert_eq!(draft.sibling_count(), 2);
    assert_eq!(live.sibling_count(), 2);
    let entries = &fx.store.backends().entries;
    assert_eq!(
        entries.count_siblings(TreeKind::Draft, content_id).await.unwrap(),
        entries.count_siblings(TreeKind::Live, content_id).await.unwrap()
    );
    // the sibling shares the published bytes
    assert_eq!(
        fx.store.read_file(TreeKind::Live, "/b.txt").await.unwrap(),
        Bytes::from_static(b"v2")
    );
    assert!(PublishBatch::collect(&fx.store, "/", common::USER)
        .await
        .unwrap()
        .is_empty());
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_delete_folder_with_moved_in_file() {
    let fx = Fixture::new().await;
    fx.store.create_folder("/src").await.unwrap();
    fx.store.create_folder("/box").await.unwrap();
    fx.file("/src/f.txt", b"moved").await;
    fx.file("/page.html", b"<a>").await;
    fx.store
        .add_relation("/page.html", "/box", RelationKind::Link)
        .await
        .unwrap();
    fx.store
        .add_relation("/page.html", "/src/f.txt", RelationKind::Link)
        .await
        .unwrap();
    assert_eq!(fx.publish_all().await.failed(), 0);
    let live_edges = fx.store.read_relations(TreeKind::Live, "/page.html").await.unwrap();
    assert!(live_edges.iter().all(|e| !e.is_broken()));

    let file_id = fx.draft("/src/f.txt").await.structure_id();
    let box_id = fx.draft("/box").await.structure_id();
    fx.store.move_resource("/src/f.txt", "/box/f.txt").await.unwrap();
    fx.store.delete_resource("/box").await.unwrap();
    assert_eq!(fx.draft("/box/f.txt").await.state(), ResourceState::Deleted);
    assert_eq!(fx.draft("/box").await.state(), ResourceState::Deleted);

    let summary = fx.publish_all().await;
    assert_eq!(summary.failed(), 0);
    let order: Vec<_> = summary.outcomes.iter().map(|o| o.structure_id).collect();
    assert_eq!(order, vec![file_id, box_id]);
    assert!(summary
        .outcomes
        .iter()
        .all(|o| o.status == ItemStatus::Published(PublishAction::Deleted)));

    for path in ["/box", "/box/f.txt", "/src/f.txt"] {
        assert!(fx.live(path).await.is_none(), "{} still live", path);
        assert!(!fx.store.exists(TreeKind::Draft, path).await.unwrap());
    }

    let history = fx.store.backends().history.read_snapshots(file_id).await.unwrap();
    let moved_source = history
        .iter()
        .find(|s| s.state == ResourceState::MovedSource)
        .unwrap();
    assert_eq!(moved_source.path, "/src/f.txt");
    let deleted = history
        .iter()
        .find(|s| s.state == ResourceState::Deleted)
        .unwrap();
    assert_eq!(deleted.path, "/box/f.txt");
    assert_eq!(deleted.version, moved_source.version);

    let mut edges = fx.store.read_relations(TreeKind::Live, "/page.html").await.unwrap();
    edges.sort_by(|a, b| a.target_path.cmp(&b.target_path));
    assert_eq!(edges.len(), 2);
    assert!(edges.iter().all(|e| e.is_broken()));
    assert_eq!(edges[0].target_path, "/box");
    assert_eq!(edges[1].target_path, "/box/f.txt");
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_publish_move_relocates_live_entry() {
    let fx = Fixture::new().await;
    fx.file("/a", b"data").await;
    fx.file("/page.html", b"<a>").await;
    let forward = fx
        .store
        .add_relation("/page.html", "/b", RelationKind::Link)
        .await
        .unwrap();
    assert!(forward.is_broken());
    fx.publish_all().await;
    let id = fx.draft("/a").await.structure_id();

    fx.store.move_resource("/a", "/b").await.unwrap();
    assert_eq!(fx.live("/a").await.unwrap().structure_id(), id);

    let summary = fx.publish_all().await;
    assert_eq!(
        summary.outcome(id).unwrap().status,
        ItemStatus::Published(PublishAction::Modified)
    );
    assert!(fx.live("/a").await.is_none());
    assert_eq!(fx.live("/b").await.unwrap().structure_id(), id);
    assert_eq!(fx.draft("/b").await.state(), ResourceState::Unchanged);

    let history = fx.store.read_history("/b").await.unwrap();
    let source = history
        .iter()
        .find(|s| s.state == ResourceState::MovedSource)
        .unwrap();
    let destination = history
        .iter()
        .find(|s| s.state == ResourceState::MovedDestination)
        .unwrap();
    assert_eq!(source.path, "/a");
    assert_eq!(destination.path, "/b");
    assert_eq!(source.version, destination.version);
    assert_eq!(source.structure_version + 1, destination.structure_version);

    let edges = fx.store.read_relations(TreeKind::Live, "/page.html").await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target_id, id);
    assert_eq!(edges[0].target_path, "/b");
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_recreate_over_deleted_entry() {
    let fx = Fixture::new().await;
    let old = fx.file("/x", b"old").await;
    fx.store
        .write_properties("/x", &[Property::individual("Title", "Old")])
        .await
        .unwrap();
    fx.publish_all().await;
    fx.store.delete_resource("/x").await.unwrap();
    fx.events.clear();

    let recreated = fx
        .store
        .create_file("/x", 1, Bytes::from_static(b"new"))
        .await
        .unwrap();
    assert_eq!(recreated.structure_id(), old.structure_id());
    assert_ne!(recreated.content_id(), old.content_id());
    assert_eq!(recreated.state(), ResourceState::Changed);
    assert!(fx.store.read_properties(TreeKind::Draft, "/x").await.unwrap().is_empty());
    let entries = &fx.store.backends().entries;
    assert!(entries
        .read_content(TreeKind::Draft, old.content_id())
        .await
        .unwrap()
        .is_none());
    assert!(fx.events.events().iter().any(|e| matches!(
        e,
        Notification::ResourceModified { tree: TreeKind::Draft, path, .. } if path == "/x"
    )));

    let summary = fx.publish_all().await;
    assert_eq!(summary.published(), 1);
    assert_eq!(fx.draft("/x").await.state(), ResourceState::Unchanged);
    let live = fx.live("/x").await.unwrap();
    assert_eq!(live.content_id(), recreated.content_id());
    assert_eq!(
        fx.store.read_file(TreeKind::Live, "/x").await.unwrap(),
        Bytes::from_static(b"new")
    );
    assert!(fx.store.read_properties(TreeKind::Live, "/x").await.unwrap().is_empty());
    assert!(entries
        .read_content(TreeKind::Live, old.content_id())
        .await
        .unwrap()
        .is_none());
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_failed_item_does_not_stop_the_run() {
    let fx = Fixture::with_backends(FailingEntries::backends("/b.txt", Failure::Backend)).await;
    for path in ["/a.txt", "/b.txt", "/c.txt"] {
        fx.file(path, b"x").await;
    }
    let before = fx.draft("/b.txt").await;
    let summary = fx.publish_all().await;
    assert_eq!(summary.published(), 2);
    assert_eq!(summary.failed(), 1);

    let failed = fx.draft("/b.txt").await;
    assert!(matches!(
        summary.outcome(failed.structure_id()).unwrap().status,
        ItemStatus::Failed(_)
    ));
    assert_eq!(failed.state(), ResourceState::New);
    assert_eq!(failed.content.version, before.content.version);
    assert_eq!(failed.structure.version, before.structure.version);
    assert!(fx.live("/b.txt").await.is_none());
    for path in ["/a.txt", "/c.txt"] {
        assert_eq!(fx.draft(path).await.state(), ResourceState::Unchanged);
        assert!(fx.live(path).await.is_some());
    }
    assert_eq!(fx.report.errors().len(), 1);
}

#[tokio::test]
async fn test_retried_item_publishes_first_version() {
    let (backends, armed) = FailingEntries::switchable("/b.txt", Failure::Backend);
    let fx = Fixture::with_backends(backends).await;
    fx.file("/b.txt", b"retry").await;
    assert_eq!(fx.publish_all().await.failed(), 1);

    armed.store(false, Ordering::SeqCst);
    let summary = fx.publish_all().await;
    assert_eq!(summary.published(), 1);
    let draft = fx.draft("/b.txt").await;
    let live = fx.live("/b.txt").await.unwrap();
    assert_eq!(draft.state(), ResourceState::Unchanged);
    assert_eq!(draft.content.version, 1);
    assert_eq!(live.content.version, 1);
    assert_eq!(live.structure.version, draft.structure.version);
    fx.assert_consistent().await;
}

#[tokio::test]
async fn test_failed_sibling_leaves_bump_to_next_sibling() {
    let fx = Fixture::with_backends(FailingEntries::backends("/c.txt", Failure::Backend)).await;
    fx.file("/c.txt", b"shared").await;
    fx.store.create_sibling("/c.txt", "/d.txt").await.unwrap();

    let summary = fx.publish_files(&["/c.txt", "/d.txt"]).await;
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.published(), 1);
    let draft = fx.draft("/d.txt").await;
    let live = fx.live("/d.txt").await.unwrap();
    assert_eq!(draft.content.version, 1);
    assert_eq!(live.content.version, 1);
    assert_eq!(fx.draft("/c.txt").await.structure.state, ResourceState::New);
    assert!(fx.live("/c.txt").await.is_none());
}

#[tokio::test]
async fn test_resource_exhaustion_aborts_run() {
    let fx = Fixture::with_backends(FailingEntries::backends("/b.txt", Failure::Exhausted)).await;
    for path in ["/a.txt", "/b.txt", "/c.txt"] {
        fx.file(path, b"x").await;
    }
    let batch = PublishBatch::collect(&fx.store, "/", common::USER).await.unwrap();
    let result = fx.publisher.publish(&batch).await;
    assert!(matches!(result, Err(RepoError::ResourceExhausted(_))));
    assert!(fx.events.events().contains(&Notification::CachesCleared));
    assert!(fx.live("/a.txt").await.is_some());
    assert!(fx.live("/c.txt").await.is_none());
    assert_eq!(fx.draft("/c.txt").await.state(), ResourceState::New);
}

#[tokio::test]
async fn test_unchanged_item_is_reported_as_failed() {
    let fx = Fixture::new().await;
    fx.file("/a.txt", b"x").await;
    fx.publish_all().await;
    let summary = fx.publish_files(&["/a.txt"]).await;
    assert_eq!(summary.failed(), 1);
    match &summary.outcomes[0].status {
        ItemStatus::Failed(message) => assert!(message.contains("no pending change")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_recreate_over_unpublished_move_is_live_conflict() {
    let fx = Fixture::new().await;
    fx.file("/a", b"x").await;
    fx.publish_all().await;
    fx.store.move_resource("/a", "/b").await.unwrap();
    let err = fx
        .store
        .create_file("/a", 1, Bytes::from_static(b"y"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::LiveConflict { .. }));
}

#[tokio::test]
async fn test_history_retention_releases_archived_content() {
    let mut config = RepositoryConfig::default();
    config.history.max_versions = 2;
    let fx = Fixture::with_config(dualstore_core::Backends::memory(), config).await;
    let id = fx.file("/h.txt", b"one").await.structure_id();
    fx.publish_all().await;
    for data in [&b"two"[..], &b"three"[..]] {
        fx.store
            .write_file("/h.txt", Bytes::copy_from_slice(data))
            .await
            .unwrap();
        fx.publish_all().await;
    }

    let history = fx.store.read_history("/h.txt").await.unwrap();
    let versions: Vec<u64> = history.iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![2, 3]);
    assert_eq!(
        fx.store.read_historical_file(id, 3).await.unwrap(),
        Bytes::from_static(b"three")
    );
    assert_eq!(
        fx.store.read_historical_file(id, 2).await.unwrap(),
        Bytes::from_static(b"two")
    );
    assert!(fx.store.read_historical_file(id, 1).await.unwrap_err().is_not_found());
}
