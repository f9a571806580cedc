//! Process directives: which pipeline step a run performs, and where.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::error::ConfigurationError;
use crate::handle::{HandleReport, HandleSettings, handle_queue};
use crate::io::config::{Binding, CONFIG_FILE_NAME, ReconcilerConfig, load_config};
use crate::io::portal::AgreementPort;
use crate::io::portal::api::{HttpPortal, load_session};
use crate::io::portal::ui::{UiPortal, UiSettings};
use crate::io::queue::{FileQueue, WorkQueue};
use crate::io::schema::SchemaValidator;
use crate::io::webdriver::WebDriverClient;
use crate::overview::{OverviewOutcome, create_overview};
use crate::upload::{UploadReport, run_upload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    CreateOverview,
    QueueUpload,
    HandleQueue,
    UploadAndHandleQueue,
}

impl ProcessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateOverview => "create_overview",
            Self::QueueUpload => "queue_upload",
            Self::HandleQueue => "handle_queue",
            Self::UploadAndHandleQueue => "upload_and_handle_queue",
        }
    }
}

impl fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON object handed to the robot at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDirective {
    pub process: ProcessMode,
    pub base_dir: PathBuf,
    #[serde(default)]
    pub notification_mail: Option<String>,
}

/// Parse and schema-check a process directive.
///
/// Every failure is a [`ConfigurationError`]: without a directive nothing
/// can run.
pub fn parse_process_directive(raw: &str) -> Result<ProcessDirective> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| ConfigurationError::new(format!("process directive is not JSON: {err}")))?;
    SchemaValidator::process_directive()?
        .check(&value)
        .map_err(ConfigurationError::new)?;
    let directive = serde_json::from_value(value)
        .map_err(|err| ConfigurationError::new(format!("invalid process directive: {err}")))?;
    Ok(directive)
}

/// What a run did, per pipeline step. Steps the mode does not include stay
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: ProcessMode,
    pub overview: Option<OverviewOutcome>,
    pub upload: Option<UploadReport>,
    pub handle: Option<HandleReport>,
}

impl RunSummary {
    fn new(mode: ProcessMode) -> Self {
        Self {
            mode,
            overview: None,
            upload: None,
            handle: None,
        }
    }

    /// Reason the run stopped early, if the session expired.
    pub fn aborted(&self) -> Option<&str> {
        self.overview
            .as_ref()
            .and_then(|outcome| outcome.report.aborted.as_deref())
            .or_else(|| self.handle.as_ref().and_then(|report| report.aborted.as_deref()))
    }

    pub fn has_failures(&self) -> bool {
        self.overview
            .as_ref()
            .is_some_and(|outcome| outcome.report.has_failures())
            || self.upload.as_ref().is_some_and(UploadReport::has_failures)
            || self.handle.as_ref().is_some_and(HandleReport::has_failures)
    }
}

/// Build the configured Access Port binding.
pub fn open_port(
    cfg: &ReconcilerConfig,
    base_dir: &Path,
    notification_mail: Option<String>,
) -> Result<Box<dyn AgreementPort>> {
    let timeout = Duration::from_secs(cfg.portal.request_timeout_secs);
    match cfg.portal.binding {
        Binding::Api => {
            let session = load_session(&cfg.session_path(base_dir))?;
            info!(base_url = %cfg.portal.base_url, "using http binding");
            Ok(Box::new(HttpPortal::new(&cfg.portal.base_url, timeout, session)))
        }
        Binding::Ui => {
            let ui = &cfg.portal.ui;
            info!(webdriver = %ui.webdriver_url, "using ui binding");
            let driver = WebDriverClient::attach(&ui.webdriver_url, &ui.session_id, timeout);
            let settings = UiSettings::from_config(&cfg.portal, notification_mail);
            Ok(Box::new(UiPortal::new(driver, settings)))
        }
    }
}

/// Run the steps of `directive.process`.
///
/// The port is opened lazily so that an upload-only run needs no session and
/// a combined run fails on a bad overview before touching the portal.
#[instrument(skip_all, fields(mode = %directive.process))]
pub fn execute<P, F, Q>(
    directive: &ProcessDirective,
    cfg: &ReconcilerConfig,
    open_port: F,
    queue: &mut Q,
    today: NaiveDate,
) -> Result<RunSummary>
where
    P: AgreementPort,
    F: FnOnce() -> Result<P>,
    Q: WorkQueue,
{
    let base_dir = directive.base_dir.as_path();
    let queue_name = cfg.queue.name.as_str();
    let mut summary = RunSummary::new(directive.process);
    match directive.process {
        ProcessMode::CreateOverview => {
            let mut port = open_port()?;
            summary.overview = Some(create_overview(&mut port, cfg, base_dir, today)?);
        }
        ProcessMode::QueueUpload => {
            summary.upload = Some(run_upload(queue, queue_name, base_dir)?);
        }
        ProcessMode::HandleQueue => {
            let mut port = open_port()?;
            let settings = HandleSettings::from_config(cfg);
            summary.handle = Some(handle_queue(&mut port, queue, queue_name, &settings)?);
        }
        ProcessMode::UploadAndHandleQueue => {
            summary.upload = Some(run_upload(queue, queue_name, base_dir)?);
            let mut port = open_port()?;
            let settings = HandleSettings::from_config(cfg);
            summary.handle = Some(handle_queue(&mut port, queue, queue_name, &settings)?);
        }
    }
    info!(failures = summary.has_failures(), "process finished");
    Ok(summary)
}

/// Load configuration for `base_dir` and execute the directive against the
/// configured portal and queue.
pub fn run_process(directive: &ProcessDirective, config_path: Option<&Path>) -> Result<RunSummary> {
    let base_dir = directive.base_dir.as_path();
    if !base_dir.is_dir() {
        return Err(ConfigurationError::new(format!(
            "base_dir {} is not a directory",
            base_dir.display()
        ))
        .into());
    }
    let cfg = load_run_config(base_dir, config_path)?;
    let mut queue = FileQueue::open(cfg.queue_path(base_dir)).context("open work queue")?;
    let today = Local::now().date_naive();
    execute(
        directive,
        &cfg,
        || open_port(&cfg, base_dir, directive.notification_mail.clone()),
        &mut queue,
        today,
    )
}

/// Config from `config_path`, or `<base_dir>/reconciler.toml`. Any load
/// failure is a configuration error.
pub fn load_run_config(base_dir: &Path, config_path: Option<&Path>) -> Result<ReconcilerConfig> {
    let path = config_path.map_or_else(|| base_dir.join(CONFIG_FILE_NAME), Path::to_path_buf);
    load_config(&path).map_err(|err| ConfigurationError::new(format!("{err:#}")).into())
}
