//! Verify repository integrity

use anyhow::{Result, anyhow};
use dualstore_core::{ResourceKind, ResourceStore, SubtreeFilter, TreeKind, ROOT_PATH};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub resources: u64,
    pub blobs: u64,
    pub snapshots: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Verify the repository at `repo_path` and print a summary
pub async fn verify_repository(repo_path: &Path, quiet: bool) -> Result<()> {
    let store = crate::open_repository(repo_path).await?;
    if !quiet {
        println!("Verifying repository: {}", repo_path.display());
    }
    let report = verify_store(&store).await?;

    if !quiet {
        for warning in &report.warnings {
            eprintln!("  WARNING: {}", warning);
        }
        for error in &report.errors {
            eprintln!("  ERROR: {}", error);
        }
    }
    println!("\nVerification:");
    println!("  Resources verified: {}", report.resources);
    println!("  Blobs verified:     {}", report.blobs);
    println!("  Snapshots verified: {}", report.snapshots);
    println!("  Errors:             {}", report.errors.len());
    println!("  Warnings:           {}", report.warnings.len());

    if !report.errors.is_empty() {
        return Err(anyhow!(
            "Repository verification failed with {} error(s)",
            report.errors.len()
        ));
    }
    if !quiet {
        println!("\n✓ Repository is healthy");
    }
    Ok(())
}

/// Check both trees and the archived history of a store
pub async fn verify_store(store: &ResourceStore) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let backends = store.backends();
    let mut seen = HashSet::new();

    for tree in [TreeKind::Draft, TreeKind::Live] {
        if let Err(e) = store.verify_invariants(tree).await {
            report.errors.push(e.to_string());
        }
        let all = backends
            .entries
            .read_subtree(
                tree,
                ROOT_PATH,
                &SubtreeFilter {
                    include_root: true,
                    ..SubtreeFilter::default()
                },
            )
            .await?;
        let ids: HashSet<_> = all.iter().map(|r| r.structure_id()).collect();

        for resource in &all {
            report.resources += 1;
            if resource.path() != ROOT_PATH {
                match resource.structure.parent_id {
                    Some(parent) if ids.contains(&parent) => {}
                    _ => report
                        .errors
                        .push(format!("{} {} has no parent folder", tree, resource.path())),
                }
            }
            if tree == TreeKind::Live && !resource.state().is_unchanged() {
                report.warnings.push(format!(
                    "live {} is in state {}",
                    resource.path(),
                    resource.state()
                ));
            }
            if resource.kind() == ResourceKind::File {
                match backends.blobs.read_blob(tree, resource.content_id()).await? {
                    Some(data) if data.len() as u64 == resource.content.size => report.blobs += 1,
                    Some(data) => report.warnings.push(format!(
                        "{} {} holds {} bytes but records {}",
                        tree,
                        resource.path(),
                        data.len(),
                        resource.content.size
                    )),
                    None if resource.content.size == 0 => {}
                    None => report
                        .errors
                        .push(format!("{} {} has no stored content", tree, resource.path())),
                }
            }
            seen.insert(resource.structure_id());
        }
    }

    for id in seen {
        for snapshot in backends.history.read_snapshots(id).await? {
            report.snapshots += 1;
            if snapshot.blob_tag.is_none() {
                continue;
            }
            if let Err(e) = store.read_historical_file(id, snapshot.version).await {
                report.errors.push(format!(
                    "history v{} of {}: {}",
                    snapshot.version, snapshot.path, e
                ));
            }
        }
    }
    Ok(report)
}
