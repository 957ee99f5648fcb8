//! Randomized checks of relation repair and version counters

mod common;

use bytes::Bytes;
use common::Fixture;
use dualstore_core::{
    MemoryBackend, Property, RelationEdge, RelationFilter, RelationKind, RelationStore,
    StructureId, TreeKind,
};
use proptest::prelude::*;
use std::collections::HashSet;

const TARGETS: [&str; 3] = ["/t0", "/t1", "/t2"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn edge_set(backend: &MemoryBackend) -> HashSet<RelationEdge> {
    backend
        .read_edges(TreeKind::Draft, &RelationFilter::default())
        .await
        .unwrap()
        .into_iter()
        .collect()
}

proptest! {
    #[test]
    fn prop_repair_is_idempotent(
        edges in prop::collection::vec((0usize..4, 0usize..3, any::<bool>(), any::<bool>()), 0..20),
        repair_target in 0usize..3,
    ) {
        let sources: Vec<StructureId> = (0..4).map(|_| StructureId::new()).collect();
        let target_ids: Vec<StructureId> = (0..3).map(|_| StructureId::new()).collect();
        runtime().block_on(async {
            let backend = MemoryBackend::new();
            for (source, target, broken, embedded) in edges {
                let edge = RelationEdge {
                    source_id: sources[source],
                    source_path: format!("/s{}", source),
                    target_id: if broken { StructureId::BROKEN } else { target_ids[target] },
                    target_path: TARGETS[target].to_string(),
                    kind: if embedded { RelationKind::Embedded } else { RelationKind::Link },
                };
                backend.create_edge(TreeKind::Draft, &edge).await.unwrap();
            }

            // the target moved to a path that some edges already expect
            let id = target_ids[repair_target];
            let path = TARGETS[(repair_target + 1) % TARGETS.len()];
            backend.repair_broken(TreeKind::Draft, id, path).await.unwrap();
            let once = edge_set(&backend).await;
            let second = backend.repair_broken(TreeKind::Draft, id, path).await.unwrap();
            let twice = edge_set(&backend).await;

            assert_eq!(second, 0);
            assert_eq!(once, twice);
            assert!(once
                .iter()
                .filter(|e| e.target_id == id)
                .all(|e| e.target_path == path));
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Edit {
    Content,
    Property,
    Rename,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![Just(Edit::Content), Just(Edit::Property), Just(Edit::Rename)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_versions_never_decrease(edits in prop::collection::vec(edit_strategy(), 1..8)) {
        runtime().block_on(async {
            let fx = Fixture::new().await;
            let mut path = "/item0.txt".to_string();
            fx.file(&path, b"0").await;
            fx.publish_all().await;
            let mut last = fx.draft(&path).await;

            for (round, edit) in edits.into_iter().enumerate() {
                match edit {
                    Edit::Content => {
                        fx.store
                            .write_file(&path, Bytes::from(format!("{}", round)))
                            .await
                            .unwrap();
                    }
                    Edit::Property => {
                        fx.store
                            .write_properties(&path, &[Property::individual("Title", format!("t{}", round))])
                            .await
                            .unwrap();
                    }
                    Edit::Rename => {
                        let next = format!("/item{}.txt", round + 1);
                        fx.store.move_resource(&path, &next).await.unwrap();
                        path = next;
                    }
                }
                let summary = fx.publish_all().await;
                assert_eq!(summary.failed(), 0);

                let current = fx.draft(&path).await;
                let structure_step = current.structure.version - last.structure.version;
                let content_step = current.content.version - last.content.version;
                // exactly one facet changed, so exactly one counter moved
                assert_eq!(structure_step + content_step, 1, "{:?}", edit);
                let live = fx.live(&path).await.unwrap();
                assert_eq!(live.structure.version, current.structure.version);
                assert_eq!(live.content.version, current.content.version);
                last = current;
            }
            fx.assert_consistent().await;
        });
    }
}
