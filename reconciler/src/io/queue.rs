//! Durable work queue.
//!
//! [`WorkQueue`] is the seam to the queue store. [`FileQueue`] keeps every
//! queue in one JSON file and rewrites it atomically after each mutation, so
//! a killed run never leaves a half-written store behind. In-memory state
//! only changes once the new file is in place.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::types::QueueStatus;
use crate::error::QueueError;
use crate::io::atomic::write_atomic;

pub type QueueItemId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub queue_name: String,
    pub reference: String,
    /// JSON document; for directives see `schemas/directive.schema.json`.
    pub payload: String,
    pub status: QueueStatus,
    /// Human-readable outcome, always set on terminal items.
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub trait WorkQueue {
    /// Insert one item per (reference, payload) pair. All or nothing.
    ///
    /// References are unique per queue among items that are not FAILED; a
    /// FAILED item does not block enqueueing its reference again.
    fn bulk_enqueue(
        &mut self,
        queue_name: &str,
        references: &[String],
        payloads: &[String],
    ) -> Result<Vec<QueueItemId>, QueueError>;

    /// Items in insertion order, optionally filtered by status.
    fn list_items(
        &self,
        queue_name: &str,
        status: Option<QueueStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, QueueError>;

    fn set_item_status(
        &mut self,
        id: QueueItemId,
        status: QueueStatus,
        message: Option<&str>,
    ) -> Result<(), QueueError>;

    fn delete_item(&mut self, id: QueueItemId) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct QueueFile {
    next_id: QueueItemId,
    items: Vec<QueueItem>,
}

/// JSON-file backed queue store.
#[derive(Debug)]
pub struct FileQueue {
    path: PathBuf,
    state: QueueFile,
}

impl FileQueue {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let state = if path.exists() {
            debug!(path = %path.display(), "loading queue");
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read queue {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse queue {}", path.display()))?
        } else {
            QueueFile {
                next_id: 1,
                items: Vec::new(),
            }
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.state.items.iter().find(|item| item.id == id)
    }

    /// Write `next` to disk, then adopt it.
    fn commit(&mut self, next: QueueFile) -> Result<(), QueueError> {
        let mut buf = serde_json::to_string_pretty(&next).context("serialize queue")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
            .with_context(|| format!("persist queue {}", self.path.display()))?;
        self.state = next;
        Ok(())
    }
}

impl WorkQueue for FileQueue {
    fn bulk_enqueue(
        &mut self,
        queue_name: &str,
        references: &[String],
        payloads: &[String],
    ) -> Result<Vec<QueueItemId>, QueueError> {
        if references.len() != payloads.len() {
            return Err(QueueError::Malformed(format!(
                "{} references but {} payloads",
                references.len(),
                payloads.len()
            )));
        }
        let mut seen: HashSet<&str> = self
            .state
            .items
            .iter()
            .filter(|item| item.queue_name == queue_name && item.status != QueueStatus::Failed)
            .map(|item| item.reference.as_str())
            .collect();
        for (reference, payload) in references.iter().zip(payloads) {
            if reference.trim().is_empty() {
                return Err(QueueError::Malformed("empty reference".to_string()));
            }
            if serde_json::from_str::<Value>(payload).is_err() {
                return Err(QueueError::Malformed(format!(
                    "payload for '{reference}' is not JSON"
                )));
            }
            if !seen.insert(reference.as_str()) {
                return Err(QueueError::DuplicateReference(reference.clone()));
            }
        }

        let now = Utc::now().to_rfc3339();
        let mut next = self.state.clone();
        let mut ids = Vec::with_capacity(references.len());
        for (reference, payload) in references.iter().zip(payloads) {
            let id = next.next_id;
            next.next_id += 1;
            next.items.push(QueueItem {
                id,
                queue_name: queue_name.to_string(),
                reference: reference.clone(),
                payload: payload.clone(),
                status: QueueStatus::New,
                message: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
            ids.push(id);
        }
        self.commit(next)?;
        debug!(queue = queue_name, count = ids.len(), "enqueued items");
        Ok(ids)
    }

    fn list_items(
        &self,
        queue_name: &str,
        status: Option<QueueStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let items = self
            .state
            .items
            .iter()
            .filter(|item| item.queue_name == queue_name)
            .filter(|item| status.is_none_or(|wanted| item.status == wanted))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(items)
    }

    fn set_item_status(
        &mut self,
        id: QueueItemId,
        status: QueueStatus,
        message: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut next = self.state.clone();
        let item = next
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::UnknownItem(id))?;
        if item.status.is_terminal() {
            return Err(QueueError::TerminalState {
                id,
                status: item.status.to_string(),
            });
        }
        item.status = status;
        if let Some(message) = message {
            item.message = Some(message.to_string());
        }
        item.updated_at = Utc::now().to_rfc3339();
        self.commit(next)?;
        debug!(item_id = id, %status, "queue item status updated");
        Ok(())
    }

    fn delete_item(&mut self, id: QueueItemId) -> Result<(), QueueError> {
        let mut next = self.state.clone();
        next.items.retain(|item| item.id != id);
        if next.items.len() == self.state.items.len() {
            return Err(QueueError::UnknownItem(id));
        }
        self.commit(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "Test_Queue";

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn enqueue_persists_and_reloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("queue.json");
        let mut queue = FileQueue::open(&path).expect("open");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a", "b"]), &strings(&["{}", "{\"x\":1}"]))
            .expect("enqueue");
        assert_eq!(ids, vec![1, 2]);

        let reloaded = FileQueue::open(&path).expect("reopen");
        let items = reloaded.list_items(QUEUE, None, None).expect("list");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].reference, "a");
        assert_eq!(items[1].status, QueueStatus::New);
    }

    #[test]
    fn duplicate_reference_rejects_whole_batch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");

        let err = queue
            .bulk_enqueue(QUEUE, &strings(&["b", "a"]), &strings(&["{}", "{}"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateReference(ref r) if r == "a"));
        assert_eq!(queue.list_items(QUEUE, None, None).expect("list").len(), 1);
    }

    #[test]
    fn same_reference_in_another_queue_is_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");
        queue
            .bulk_enqueue("Other", &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue other queue");
    }

    #[test]
    fn malformed_batches_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        let err = queue
            .bulk_enqueue(QUEUE, &strings(&["a", "b"]), &strings(&["{}"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Malformed(_)));

        let err = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["not json"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Malformed(_)));
    }

    #[test]
    fn terminal_items_cannot_change_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");
        queue
            .set_item_status(ids[0], QueueStatus::InProgress, None)
            .expect("in progress");
        queue
            .set_item_status(ids[0], QueueStatus::Done, Some("ok"))
            .expect("done");

        let err = queue
            .set_item_status(ids[0], QueueStatus::New, None)
            .unwrap_err();
        assert!(matches!(err, QueueError::TerminalState { .. }));
        let item = queue.get(ids[0]).expect("item");
        assert_eq!(item.status, QueueStatus::Done);
        assert_eq!(item.message.as_deref(), Some("ok"));
    }

    #[test]
    fn list_filters_by_status_and_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        let ids = queue
            .bulk_enqueue(
                QUEUE,
                &strings(&["a", "b", "c"]),
                &strings(&["{}", "{}", "{}"]),
            )
            .expect("enqueue");
        queue
            .set_item_status(ids[1], QueueStatus::Failed, Some("boom"))
            .expect("fail");

        let new_items = queue
            .list_items(QUEUE, Some(QueueStatus::New), None)
            .expect("list");
        assert_eq!(new_items.len(), 2);
        let limited = queue.list_items(QUEUE, None, Some(1)).expect("list");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].reference, "a");
    }

    #[test]
    fn delete_removes_item_and_frees_reference() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");
        queue.delete_item(ids[0]).expect("delete");
        assert!(matches!(
            queue.delete_item(ids[0]),
            Err(QueueError::UnknownItem(_))
        ));
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("re-enqueue");
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn failed_item_does_not_block_its_reference() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut queue = FileQueue::open(temp.path().join("queue.json")).expect("open");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");
        queue
            .set_item_status(ids[0], QueueStatus::Failed, Some("not found"))
            .expect("fail");

        let again = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("re-enqueue");
        assert_ne!(again, ids);
        let err = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateReference(_)));
    }

    #[test]
    fn failed_write_leaves_queue_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("queue.json");
        let mut queue = FileQueue::open(&path).expect("open");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["a"]), &strings(&["{}"]))
            .expect("enqueue");
        // A directory where the temp file goes makes every write fail.
        let blocker = temp.path().join("queue.json.tmp");
        fs::create_dir(&blocker).expect("block temp file");

        let err = queue
            .bulk_enqueue(QUEUE, &strings(&["b"]), &strings(&["{}"]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));
        assert!(
            queue
                .set_item_status(ids[0], QueueStatus::InProgress, None)
                .is_err()
        );
        assert!(queue.delete_item(ids[0]).is_err());

        let items = queue.list_items(QUEUE, None, None).expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::New);
        assert_eq!(FileQueue::open(&path).expect("reopen").state, queue.state);

        fs::remove_dir(&blocker).expect("unblock");
        let ids = queue
            .bulk_enqueue(QUEUE, &strings(&["b"]), &strings(&["{}"]))
            .expect("enqueue after unblock");
        assert_eq!(ids, vec![2]);
    }
}
