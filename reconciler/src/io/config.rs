//! Reconciler configuration stored as `<base_dir>/reconciler.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::types::Institution;

pub const CONFIG_FILE_NAME: &str = "reconciler.toml";
pub const DEFAULT_QUEUE_NAME: &str = "Databehandlingsaftale_Status_Queue";
pub const DEFAULT_PORTAL_URL: &str = "https://tilslutning.stil.dk";

/// Reconciler configuration (TOML).
///
/// Edited by humans. Missing fields default to the values the portal robot
/// has always run with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub portal: PortalConfig,
    pub retry: RetryConfig,
    pub verify: VerifyConfig,
    pub queue: QueueConfig,
    /// Institutions the overview scan is expected to cover.
    pub institutions: Vec<Institution>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    Api,
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortalConfig {
    pub binding: Binding,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Session cookies written by the out-of-band login step (API binding).
    pub session_file: PathBuf,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub webdriver_url: String,
    /// Id of an existing, already logged-in WebDriver session.
    pub session_id: String,
    pub element_timeout_secs: u64,
    pub popup_timeout_secs: u64,
    /// Zero-based cell positions in the agreements table.
    pub system_column: usize,
    pub service_column: usize,
    pub status_column: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Upper bound for the remote view to reflect a mutation.
    pub timeout_secs: u64,
    pub poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub path: PathBuf,
    /// Maximum number of items handled per run.
    pub limit: Option<usize>,
    /// Pick up IN_PROGRESS items left behind by an interrupted run.
    pub resume_in_progress: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            binding: Binding::Api,
            base_url: DEFAULT_PORTAL_URL.to_string(),
            request_timeout_secs: 30,
            session_file: PathBuf::from("session.json"),
            ui: UiConfig::default(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            session_id: String::new(),
            element_timeout_secs: 20,
            popup_timeout_secs: 5,
            system_column: 0,
            service_column: 1,
            status_column: 2,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 2_000,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            poll_ms: 1_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            path: PathBuf::from("queue.json"),
            limit: None,
            resume_in_progress: true,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            portal: PortalConfig::default(),
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            queue: QueueConfig::default(),
            institutions: Vec::new(),
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.portal.base_url.trim().is_empty() {
            return Err(anyhow!("portal.base_url must be non-empty"));
        }
        if self.portal.request_timeout_secs == 0 {
            return Err(anyhow!("portal.request_timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.queue.name.trim().is_empty() {
            return Err(anyhow!("queue.name must be non-empty"));
        }
        if self.queue.limit == Some(0) {
            return Err(anyhow!("queue.limit must be > 0 when set"));
        }
        if self.portal.binding == Binding::Ui {
            let ui = &self.portal.ui;
            if ui.webdriver_url.trim().is_empty() || ui.session_id.trim().is_empty() {
                return Err(anyhow!(
                    "portal.ui.webdriver_url and portal.ui.session_id are required \
                     for the ui binding"
                ));
            }
            if ui.element_timeout_secs == 0 {
                return Err(anyhow!("portal.ui.element_timeout_secs must be > 0"));
            }
        }
        for inst in &self.institutions {
            if inst.id.trim().is_empty() {
                return Err(anyhow!("institutions: id must be non-empty"));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
        )
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify.timeout_secs)
    }

    pub fn verify_poll(&self) -> Duration {
        Duration::from_millis(self.verify.poll_ms)
    }

    /// Queue file location, relative paths resolved against `base_dir`.
    pub fn queue_path(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.queue.path)
    }

    pub fn session_path(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.portal.session_file)
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ReconcilerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ReconcilerConfig> {
    if !path.exists() {
        let cfg = ReconcilerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ReconcilerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
