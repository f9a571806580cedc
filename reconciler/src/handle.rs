//! Execution State Machine: applies queued directives to the portal.
//!
//! Items are grouped by institution so the remote context is opened once per
//! group. Every item goes NEW -> IN_PROGRESS -> DONE | FAILED; terminal items
//! are never touched again. A retry re-reads the remote view from scratch.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::retry::{GaveUp, RetryPolicy, retry, wait_until};
use crate::core::types::{Action, AgreementView, Directive, Institution, QueueStatus};
use crate::error::PortError;
use crate::io::config::ReconcilerConfig;
use crate::io::portal::{AgreementPort, ExecutionContext};
use crate::io::queue::{QueueItem, QueueItemId, WorkQueue};
use crate::io::schema::SchemaValidator;

pub const ALREADY_DONE: &str = "already in desired state";
pub const NOT_CHANGED: &str = "status did not change as expected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSettings {
    pub retry: RetryPolicy,
    /// Bound for the remote view to reflect a mutation.
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
    pub limit: Option<usize>,
    pub resume_in_progress: bool,
}

impl HandleSettings {
    pub fn from_config(cfg: &ReconcilerConfig) -> Self {
        Self {
            retry: cfg.retry_policy(),
            verify_timeout: cfg.verify_timeout(),
            verify_poll: cfg.verify_poll(),
            limit: cfg.queue.limit,
            resume_in_progress: cfg.queue.resume_in_progress,
        }
    }
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self::from_config(&ReconcilerConfig::default())
    }
}

/// Terminal result of one queue item in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: QueueItemId,
    pub reference: String,
    pub institution_id: Option<String>,
    pub status: QueueStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleReport {
    pub outcomes: Vec<ItemOutcome>,
    /// Set when the run stopped because the session expired. Items not yet
    /// finished keep their status for the next run.
    pub aborted: Option<String>,
}

impl HandleReport {
    pub fn done(&self) -> usize {
        self.count(QueueStatus::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(QueueStatus::Failed)
    }

    fn count(&self, status: QueueStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || self.aborted.is_some()
    }
}

/// How one attempt at an item ended, short of a port error.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Done(String),
    Failed(String),
}

struct WorkItem {
    item: QueueItem,
    directive: Directive,
}

struct Group {
    institution: Institution,
    items: Vec<WorkItem>,
}

/// Records terminal transitions in the queue and the report.
struct Recorder<'q, Q> {
    queue: &'q mut Q,
    report: HandleReport,
}

impl<Q: WorkQueue> Recorder<'_, Q> {
    fn start(&mut self, item: &QueueItem) -> Result<()> {
        if item.status == QueueStatus::InProgress {
            return Ok(());
        }
        self.queue
            .set_item_status(item.id, QueueStatus::InProgress, None)
            .with_context(|| format!("mark {} in progress", item.reference))
    }

    fn finish(
        &mut self,
        item: &QueueItem,
        institution_id: Option<&str>,
        status: QueueStatus,
        message: &str,
    ) -> Result<()> {
        self.queue
            .set_item_status(item.id, status, Some(message))
            .with_context(|| format!("mark {} {status}", item.reference))?;
        if status == QueueStatus::Done {
            info!(reference = %item.reference, item_id = item.id, message, "item done");
        } else {
            warn!(reference = %item.reference, item_id = item.id, message, "item failed");
        }
        self.report.outcomes.push(ItemOutcome {
            id: item.id,
            reference: item.reference.clone(),
            institution_id: institution_id.map(str::to_string),
            status,
            message: message.to_string(),
        });
        Ok(())
    }

    fn fail_all(&mut self, items: &[WorkItem], message: &str) -> Result<()> {
        for work in items {
            let id = work.directive.institution_id.as_str();
            self.finish(&work.item, Some(id), QueueStatus::Failed, message)?;
        }
        Ok(())
    }
}

/// Process the queue's open items against `port`.
///
/// Queue store failures abort with an error; everything that goes wrong with
/// a single item or institution is recorded on the item instead.
#[instrument(skip_all, fields(queue = queue_name))]
pub fn handle_queue<P: AgreementPort, Q: WorkQueue>(
    port: &mut P,
    queue: &mut Q,
    queue_name: &str,
    settings: &HandleSettings,
) -> Result<HandleReport> {
    let validator = SchemaValidator::directive()?;
    let items = open_items(queue, queue_name, settings)?;
    info!(items = items.len(), "handling queue");

    let mut recorder = Recorder {
        queue,
        report: HandleReport::default(),
    };
    let mut groups: Vec<Group> = Vec::new();
    for item in items {
        match decode_payload(&validator, &item.payload) {
            Ok(directive) => {
                let institution = directive.institution();
                let work = WorkItem { item, directive };
                match groups.iter_mut().find(|group| group.institution == institution) {
                    Some(group) => group.items.push(work),
                    None => groups.push(Group {
                        institution,
                        items: vec![work],
                    }),
                }
            }
            Err(message) => {
                error!(reference = %item.reference, %message, "malformed queue payload");
                recorder.finish(&item, None, QueueStatus::Failed, &message)?;
            }
        }
    }

    for group in &groups {
        if let Some(reason) = handle_group(port, &mut recorder, group, settings)? {
            error!(%reason, "session expired, stopping queue run");
            recorder.report.aborted = Some(reason);
            break;
        }
    }

    let report = recorder.report;
    info!(
        done = report.done(),
        failed = report.failed(),
        aborted = report.aborted.is_some(),
        "queue handled"
    );
    Ok(report)
}

fn open_items<Q: WorkQueue>(
    queue: &Q,
    queue_name: &str,
    settings: &HandleSettings,
) -> Result<Vec<QueueItem>> {
    let mut items = queue
        .list_items(queue_name, Some(QueueStatus::New), None)
        .context("list new queue items")?;
    if settings.resume_in_progress {
        let resumed = queue
            .list_items(queue_name, Some(QueueStatus::InProgress), None)
            .context("list in-progress queue items")?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resuming interrupted items");
        }
        items.extend(resumed);
        items.sort_by_key(|item| item.id);
    }
    if let Some(limit) = settings.limit {
        items.truncate(limit);
    }
    Ok(items)
}

fn decode_payload(validator: &SchemaValidator, payload: &str) -> Result<Directive, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| format!("payload is not JSON: {err}"))?;
    validator.check(&value)?;
    serde_json::from_value(value).map_err(|err| format!("payload is not a directive: {err}"))
}

fn open_with_retry<P: AgreementPort>(
    port: &mut P,
    institution: &Institution,
    policy: &RetryPolicy,
) -> Result<ExecutionContext, GaveUp<PortError>> {
    retry(policy, PortError::is_retryable, |attempt| {
        debug!(institution = %institution.id, attempt, "opening institution");
        port.open_context(institution)
    })
}

/// Returns the abort reason when the session expired.
#[instrument(skip_all, fields(institution = %group.institution.id, items = group.items.len()))]
fn handle_group<P: AgreementPort, Q: WorkQueue>(
    port: &mut P,
    recorder: &mut Recorder<'_, Q>,
    group: &Group,
    settings: &HandleSettings,
) -> Result<Option<String>> {
    let institution = &group.institution;
    let mut ctx = match open_with_retry(port, institution, &settings.retry) {
        Ok(ctx) => ctx,
        Err(gave_up) if gave_up.error.is_session_expired() => {
            return Ok(Some(gave_up.error.to_string()));
        }
        Err(gave_up) => {
            let message = format!(
                "could not open institution {} after {} attempts: {}",
                institution.id, gave_up.attempts, gave_up.error
            );
            error!(%message, "institution context failed");
            recorder.fail_all(&group.items, &message)?;
            return Ok(None);
        }
    };

    for (index, work) in group.items.iter().enumerate() {
        let item = &work.item;
        let inst_id = Some(work.directive.institution_id.as_str());
        recorder.start(item)?;

        let result = retry(&settings.retry, PortError::is_retryable, |attempt| {
            if attempt > 1 {
                warn!(reference = %item.reference, attempt, "retrying item");
            }
            apply_directive(port, &ctx, &work.directive, settings)
        });
        let gave_up = match result {
            Ok(Resolution::Done(message)) => {
                recorder.finish(item, inst_id, QueueStatus::Done, &message)?;
                continue;
            }
            Ok(Resolution::Failed(message)) => {
                recorder.finish(item, inst_id, QueueStatus::Failed, &message)?;
                continue;
            }
            Err(gave_up) => gave_up,
        };

        if gave_up.error.is_session_expired() {
            // Left IN_PROGRESS; the next run resumes it.
            return Ok(Some(gave_up.error.to_string()));
        }
        let message = format!("{} (after {} attempts)", gave_up.error, gave_up.attempts);
        recorder.finish(item, inst_id, QueueStatus::Failed, &message)?;
        if !gave_up.error.is_retryable() {
            continue;
        }

        // Repeated transport failures: start over with a fresh context.
        let rest = &group.items[index + 1..];
        if rest.is_empty() {
            break;
        }
        match open_with_retry(port, institution, &settings.retry) {
            Ok(fresh) => ctx = fresh,
            Err(err) if err.error.is_session_expired() => return Ok(Some(err.error.to_string())),
            Err(err) => {
                let message = format!(
                    "could not reopen institution {} after {} attempts: {}",
                    institution.id, err.attempts, err.error
                );
                recorder.fail_all(rest, &message)?;
                return Ok(None);
            }
        }
    }
    Ok(None)
}

/// One full attempt: read the view, mutate if needed, confirm the result.
fn apply_directive<P: AgreementPort>(
    port: &mut P,
    ctx: &ExecutionContext,
    directive: &Directive,
    settings: &HandleSettings,
) -> Result<Resolution, PortError> {
    let view = port.list_agreements(ctx)?;
    let system = directive.system_name.as_str();
    let service = directive.service_name.as_str();

    let Some(agreement) = view.find(system, service, directive.observed_status) else {
        if target_reached(&view, directive) {
            return Ok(Resolution::Done(ALREADY_DONE.to_string()));
        }
        return Ok(Resolution::Failed(format!(
            "not found: no {system}/{service} agreement with status {}",
            directive.observed_status
        )));
    };
    if !directive.action.accepts_pre_state(agreement.status) {
        return Ok(Resolution::Failed(format!(
            "cannot apply {} to {system}/{service}: found {}, expected {}",
            directive.action,
            agreement.status,
            expected_pre_state(directive.action)
        )));
    }

    match directive.action {
        Action::Approve | Action::Wait => {
            port.request_status_change(ctx, agreement, directive.target_status())?;
        }
        Action::Delete => port.request_delete(ctx, agreement)?,
    }

    let confirmed = wait_until(settings.verify_timeout, settings.verify_poll, || {
        let view = port.list_agreements(ctx)?;
        Ok::<_, PortError>(target_reached(&view, directive))
    })?;
    if confirmed {
        Ok(Resolution::Done(directive.action.success_message().to_string()))
    } else {
        Ok(Resolution::Failed(NOT_CHANGED.to_string()))
    }
}

/// Deletion is reached when no live record is left for the pair.
fn target_reached(view: &AgreementView, directive: &Directive) -> bool {
    let system = directive.system_name.as_str();
    let service = directive.service_name.as_str();
    match directive.action {
        Action::Delete => !view.has_live(system, service),
        Action::Approve | Action::Wait => view
            .find(system, service, directive.target_status())
            .is_some(),
    }
}

fn expected_pre_state(action: Action) -> &'static str {
    match action {
        Action::Approve => "VENTER",
        Action::Wait => "GODKENDT",
        Action::Delete => "VENTER or GODKENDT",
    }
}
