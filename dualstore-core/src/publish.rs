//! Publish orchestrator
//!
//! Drains a [`PublishBatch`] against the resource store: folders first, then
//! files, then deleted folders. Each item is published on its own; a failing
//! item is reported and skipped while the run carries on. Only fatal errors
//! abort the run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use crate::events::Notification;
use crate::history::PublishRunRecord;
use crate::locks::LockStore;
use crate::object::{ROOT_PATH, RunId, StructureId, TreeKind, path_depth};
use crate::publish_step::{PublishAction, PublishContext};
use crate::report::{Report, Severity};
use crate::resource_store::ResourceStore;
use crate::storage::{RepoError, Result, SubtreeFilter};

/// Ordered change set of one publish run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishBatch {
    pub run_id: RunId,
    pub user: String,
    /// New or changed folders, parents before children
    pub folders: Vec<StructureId>,
    /// New, changed or deleted files
    pub files: Vec<StructureId>,
    /// Deleted folders, children before parents
    pub deleted_folders: Vec<StructureId>,
}

impl PublishBatch {
    pub fn new(user: &str) -> Self {
        Self {
            run_id: RunId::new(),
            user: user.to_string(),
            folders: Vec::new(),
            files: Vec::new(),
            deleted_folders: Vec::new(),
        }
    }

    /// Pending draft changes at or below `root`
    pub async fn collect(store: &ResourceStore, root: &str, user: &str) -> Result<Self> {
        let pending = store
            .read_subtree(TreeKind::Draft, root, &SubtreeFilter::pending())
            .await?;
        let mut batch = Self::new(user);
        let mut folders = Vec::new();
        let mut deleted_folders = Vec::new();
        for resource in pending {
            if resource.path() == ROOT_PATH {
                continue;
            }
            if !resource.is_folder() {
                batch.files.push(resource.structure_id());
            } else if resource.structure.state.is_deleted() {
                deleted_folders.push((path_depth(resource.path()), resource.structure_id()));
            } else {
                folders.push((path_depth(resource.path()), resource.structure_id()));
            }
        }
        // subtree reads come back in path order; sort_by_key is stable
        folders.sort_by_key(|(depth, _)| *depth);
        deleted_folders.sort_by_key(|(depth, _)| std::cmp::Reverse(*depth));
        batch.folders = folders.into_iter().map(|(_, id)| id).collect();
        batch.deleted_folders = deleted_folders.into_iter().map(|(_, id)| id).collect();
        Ok(batch)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every item in processing order
    pub fn items(&self) -> impl Iterator<Item = StructureId> + '_ {
        self.folders
            .iter()
            .chain(self.files.iter())
            .chain(self.deleted_folders.iter())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.folders.len() + self.files.len() + self.deleted_folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one batch item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub structure_id: StructureId,
    /// Draft path at the time of publishing, if the item could be read
    pub path: Option<String>,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Published(PublishAction),
    Failed(String),
}

/// What a publish run did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSummary {
    pub run_id: RunId,
    pub publish_tag: u64,
    pub outcomes: Vec<ItemOutcome>,
    /// The run stopped early on request
    pub cancelled: bool,
}

impl PublishSummary {
    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Published(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed(_)))
            .count()
    }

    pub fn outcome(&self, id: StructureId) -> Option<&ItemOutcome> {
        self.outcomes.iter().find(|o| o.structure_id == id)
    }
}

/// Runs publish batches against a resource store
pub struct Publisher {
    store: Arc<ResourceStore>,
    locks: Arc<dyn LockStore>,
    report: Arc<dyn Report>,
    cancel: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(store: Arc<ResourceStore>, locks: Arc<dyn LockStore>, report: Arc<dyn Report>) -> Self {
        Self {
            store,
            locks,
            report,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the current run before its next item
    ///
    /// A run that stops on the flag clears it again.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    /// Publish every item of `batch`
    pub async fn publish(&self, batch: &PublishBatch) -> Result<PublishSummary> {
        let history = &self.store.backends().history;
        let publish_tag = history.next_publish_tag().await?;
        let mut ctx = PublishContext::new(batch.run_id, publish_tag, &batch.user);
        history
            .write_run(&PublishRunRecord {
                run_id: ctx.run_id,
                publish_tag,
                user: ctx.user.clone(),
                started_at: ctx.started_at,
                item_count: batch.len(),
            })
            .await?;
        info!(
            "Publish run {} (tag {}) started by {} with {} item(s)",
            ctx.run_id,
            publish_tag,
            ctx.user,
            batch.len()
        );

        for id in batch.items() {
            if let Some(structure) = self
                .store
                .backends()
                .entries
                .read_structure(TreeKind::Draft, id)
                .await?
            {
                ctx.memo.expect(structure.content_id);
            }
        }

        let mut summary = PublishSummary {
            run_id: ctx.run_id,
            publish_tag,
            outcomes: Vec::with_capacity(batch.len()),
            cancelled: false,
        };
        let total = batch.len();
        for (index, id) in batch.items().enumerate() {
            if self.cancel.swap(false, Ordering::SeqCst) {
                self.report
                    .print_line(&format!("Publish cancelled after {} of {} item(s)", index, total), Severity::Note);
                info!("Publish run {} cancelled", ctx.run_id);
                summary.cancelled = true;
                break;
            }
            let outcome = match self.publish_item(&mut ctx, id, index + 1, total).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.store.clear_caches();
                    self.report
                        .print_line(&format!("Publish aborted: {}", err), Severity::Error);
                    error!("Publish run {} aborted: {}", ctx.run_id, err);
                    return Err(err);
                }
            };
            summary.outcomes.push(outcome);
        }

        self.store.events().notify(Notification::PublishFinished {
            run_id: ctx.run_id,
            publish_tag,
            published: summary.published(),
            failed: summary.failed(),
        });
        info!(
            "Publish run {} finished: {} published, {} failed",
            ctx.run_id,
            summary.published(),
            summary.failed()
        );
        Ok(summary)
    }

    /// Publish one item; only fatal errors escape
    async fn publish_item(
        &self,
        ctx: &mut PublishContext,
        id: StructureId,
        position: usize,
        total: usize,
    ) -> Result<ItemOutcome> {
        let draft = match self.store.read_resource_by_id(TreeKind::Draft, id).await {
            Ok(Some(draft)) => draft,
            Ok(None) => {
                let err = RepoError::NotFound(format!("Draft entry {}", id));
                return Ok(self.failed(ctx, id, None, err));
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => return Ok(self.failed(ctx, id, None, err)),
        };
        let path = draft.path().to_string();
        let cid = draft.content_id();
        self.report.print(
            &format!("[{}/{}] Publishing {} ... ", position, total, path),
            Severity::Note,
        );

        let result = async {
            let item = self.store.publish_resource(ctx, &draft).await?;
            self.store.finish_resource(id, item).await?;
            self.locks.release(id).await?;
            Ok::<_, RepoError>(item.action)
        }
        .await;
        if result.is_err() {
            ctx.memo.forget_bump(cid, id);
        }
        ctx.memo.finish_item(cid);
        self.store.invalidate_live_cache();

        match result {
            Ok(action) => {
                info!(
                    target: "dualstore::audit",
                    action = %action,
                    path = %path,
                    structure_id = %id,
                    run_id = %ctx.run_id,
                    publish_tag = ctx.publish_tag,
                    user = %ctx.user,
                    "published"
                );
                self.report.print_line("OK", Severity::Ok);
                Ok(ItemOutcome {
                    structure_id: id,
                    path: Some(path),
                    status: ItemStatus::Published(action),
                })
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(self.failed(ctx, id, Some(path), err)),
        }
    }

    fn failed(&self, ctx: &PublishContext, id: StructureId, path: Option<String>, err: RepoError) -> ItemOutcome {
        let shown = path.clone().unwrap_or_else(|| id.to_string());
        self.report
            .print_line(&format!("failed: {}: {}", shown, err), Severity::Error);
        warn!("Publish run {}: {} failed: {}", ctx.run_id, shown, err);
        ItemOutcome {
            structure_id: id,
            path,
            status: ItemStatus::Failed(err.to_string()),
        }
    }
}
