//! Directive Uploader: overview sheet to queue items.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::core::directives::generate_directives;
use crate::core::reference::{PlannedBatch, PlannedItem, plan_batches};
use crate::core::types::{Action, DirectiveSet, QueueStatus};
use crate::io::queue::{QueueItem, WorkQueue};
use crate::io::sheet::{find_overview, read_desired_rows};

/// What one upload did, per reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub enqueued: Vec<String>,
    /// Already queued and not failed.
    pub skipped: Vec<String>,
    /// Previously FAILED items replaced by a fresh NEW item.
    pub requeued: Vec<String>,
    /// Batches whose bulk insert failed, with the error.
    pub failed_batches: Vec<(Action, String)>,
}

impl UploadReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_batches.is_empty()
    }
}

/// Read the single overview in `base_dir` and derive its directives.
pub fn retrieve_changes(base_dir: &Path) -> Result<DirectiveSet> {
    let path = find_overview(base_dir)?;
    info!(path = %path.display(), "reading overview");
    let rows = read_desired_rows(&path)?;
    let set = generate_directives(&rows, None);
    info!(
        rows = rows.len(),
        approve = set.approve.len(),
        wait = set.wait.len(),
        delete = set.delete.len(),
        "directives generated"
    );
    Ok(set)
}

/// Directives and references an upload of `base_dir` would create.
pub fn plan_upload(base_dir: &Path) -> Result<Vec<PlannedBatch>> {
    let set = retrieve_changes(base_dir)?;
    plan_batches(&set).context("serialize directives")
}

/// Enqueue every planned batch with one bulk call per action class.
///
/// A failing batch is logged and recorded; the remaining batches are still
/// attempted. Only errors reading the queue abort the upload. A FAILED item
/// is removed only after its replacement is in the queue.
#[instrument(skip_all, fields(queue = queue_name))]
pub fn upload_batches<Q: WorkQueue>(
    queue: &mut Q,
    queue_name: &str,
    batches: &[PlannedBatch],
) -> Result<UploadReport> {
    let mut report = UploadReport::default();
    for batch in batches {
        if batch.items.is_empty() {
            debug!(action = %batch.action, "nothing to upload");
            continue;
        }
        let existing: BTreeMap<String, QueueItem> = queue
            .list_items(queue_name, None, None)
            .context("list queue items")?
            .into_iter()
            .map(|item| (item.reference.clone(), item))
            .collect();

        let mut pending: Vec<&PlannedItem> = Vec::new();
        let mut superseded: Vec<&QueueItem> = Vec::new();
        for item in &batch.items {
            match existing.get(&item.reference) {
                None => pending.push(item),
                Some(old) if old.status == QueueStatus::Failed => {
                    superseded.push(old);
                    pending.push(item);
                }
                Some(old) => {
                    debug!(reference = %item.reference, status = %old.status, "already queued");
                    report.skipped.push(item.reference.clone());
                }
            }
        }
        if pending.is_empty() {
            continue;
        }

        let references: Vec<String> = pending.iter().map(|item| item.reference.clone()).collect();
        let payloads: Vec<String> = pending.iter().map(|item| item.payload.clone()).collect();
        match queue.bulk_enqueue(queue_name, &references, &payloads) {
            Ok(ids) => {
                info!(action = %batch.action, count = ids.len(), "batch uploaded");
                for old in superseded {
                    if let Err(err) = queue.delete_item(old.id) {
                        warn!(reference = %old.reference, %err, "could not remove failed item");
                    }
                    report.requeued.push(old.reference.clone());
                }
                report.enqueued.extend(references);
            }
            Err(err) => {
                error!(action = %batch.action, %err, "batch upload failed");
                report.failed_batches.push((batch.action, err.to_string()));
            }
        }
    }
    Ok(report)
}

/// Overview to queue in one go.
pub fn run_upload<Q: WorkQueue>(
    queue: &mut Q,
    queue_name: &str,
    base_dir: &Path,
) -> Result<UploadReport> {
    let batches = plan_upload(base_dir)?;
    upload_batches(queue, queue_name, &batches)
}
