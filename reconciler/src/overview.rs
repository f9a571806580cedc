//! Snapshot Collector and overview export.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{error, info, instrument, warn};

use crate::core::retry::{RetryPolicy, retry};
use crate::core::types::{Institution, Snapshot};
use crate::error::{ConfigurationError, PortError};
use crate::io::config::ReconcilerConfig;
use crate::io::portal::AgreementPort;
use crate::io::sheet::{ErrorLogEntry, write_error_log, write_overview};

const MISSING_MESSAGE: &str = "institution missing from overview";

/// Result of one pass over all configured institutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub snapshot: Snapshot,
    /// Institutions whose scan failed, with the final error.
    pub errors: Vec<ErrorLogEntry>,
    /// Expected institutions that contributed no data, failed or not.
    pub missing: Vec<Institution>,
    /// Set when the scan stopped early because the session expired.
    pub aborted: Option<String>,
}

impl CollectionReport {
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || !self.missing.is_empty() || self.aborted.is_some()
    }

    /// Error log lines: scan failures first, then silently skipped institutions.
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        let failed: BTreeSet<&Institution> =
            self.errors.iter().map(|entry| &entry.institution).collect();
        let mut entries = self.errors.clone();
        entries.extend(
            self.missing
                .iter()
                .filter(|inst| !failed.contains(inst))
                .map(|inst| ErrorLogEntry {
                    institution: inst.clone(),
                    error: MISSING_MESSAGE.to_string(),
                }),
        );
        entries
    }
}

/// Read every institution's agreements into one snapshot.
///
/// A failing institution is logged and skipped. Only an expired session stops
/// the pass early. The missing-institution check runs in every case.
#[instrument(skip_all, fields(institutions = institutions.len()))]
pub fn collect_snapshot<P: AgreementPort>(
    port: &mut P,
    institutions: &[Institution],
    policy: &RetryPolicy,
) -> CollectionReport {
    let mut agreements = Vec::new();
    let mut errors = Vec::new();
    let mut observed: BTreeSet<Institution> = BTreeSet::new();
    let mut aborted = None;

    for inst in institutions {
        let result = retry(policy, PortError::is_retryable, |attempt| {
            if attempt > 1 {
                warn!(institution = %inst.id, attempt, "retrying institution scan");
            }
            let ctx = port.open_context(inst)?;
            port.list_agreements(&ctx)
        });
        match result {
            Ok(view) => {
                if view.keyed().len() < view.len() {
                    warn!(
                        institution = %inst.id,
                        "agreements share system, service and status; keeping all records"
                    );
                }
                info!(institution = %inst.id, agreements = view.len(), "institution scanned");
                observed.insert(inst.clone());
                agreements.extend(view.agreements.into_iter().map(|mut agr| {
                    agr.institution_id = inst.id.clone();
                    agr.organisation = inst.organisation;
                    agr
                }));
            }
            Err(gave_up) => {
                error!(
                    institution = %inst.id,
                    attempts = gave_up.attempts,
                    error = %gave_up.error,
                    "institution scan failed"
                );
                errors.push(ErrorLogEntry {
                    institution: inst.clone(),
                    error: gave_up.error.to_string(),
                });
                if gave_up.error.is_session_expired() {
                    aborted = Some(gave_up.error.to_string());
                    break;
                }
            }
        }
    }

    let missing: Vec<Institution> = institutions
        .iter()
        .filter(|inst| !observed.contains(*inst))
        .cloned()
        .collect();
    for inst in &missing {
        warn!(institution = %inst.id, organisation = %inst.organisation, "{MISSING_MESSAGE}");
    }

    CollectionReport {
        snapshot: Snapshot {
            taken_at: Utc::now(),
            agreements,
        },
        errors,
        missing,
        aborted,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewOutcome {
    pub report: CollectionReport,
    pub overview_path: PathBuf,
    pub error_log_path: Option<PathBuf>,
}

/// Collect a snapshot of the configured institutions and write the overview
/// plus, when anything went wrong, the error log.
pub fn create_overview<P: AgreementPort>(
    port: &mut P,
    cfg: &ReconcilerConfig,
    base_dir: &Path,
    date: NaiveDate,
) -> Result<OverviewOutcome> {
    if cfg.institutions.is_empty() {
        return Err(ConfigurationError::new("no institutions configured").into());
    }
    let report = collect_snapshot(port, &cfg.institutions, &cfg.retry_policy());
    let overview_path = write_overview(base_dir, date, &report.snapshot)?;
    let entries = report.error_log();
    let error_log_path = if entries.is_empty() {
        None
    } else {
        Some(write_error_log(base_dir, date, &entries)?)
    };
    info!(
        agreements = report.snapshot.agreements.len(),
        failed = report.errors.len(),
        missing = report.missing.len(),
        "overview created"
    );
    Ok(OverviewOutcome {
        report,
        overview_path,
        error_log_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AgreementStatus, OrganisationKind};
    use crate::test_support::{FakePortal, agreement, daycare_agreement};

    fn institutions() -> Vec<Institution> {
        vec![
            Institution::new("11111", OrganisationKind::Institution),
            Institution::new("99999", OrganisationKind::Institution),
            Institution::new("22222", OrganisationKind::Daycare),
        ]
    }

    #[test]
    fn failing_institution_is_reported_and_others_collected() {
        let mut portal = FakePortal::new()
            .with_agreement(agreement("11111", "SysX", "SvcY", AgreementStatus::Awaiting))
            .with_agreement(daycare_agreement("22222", "SysA", "SvcB", AgreementStatus::Approved))
            .failing_context("99999", 10);

        let report = collect_snapshot(&mut portal, &institutions(), &RetryPolicy::once());
        assert_eq!(report.snapshot.agreements.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].institution.id, "99999");
        assert_eq!(
            report.missing,
            vec![Institution::new("99999", OrganisationKind::Institution)]
        );
        assert!(report.aborted.is_none());
        assert!(report.has_failures());
    }

    #[test]
    fn transient_failures_are_retried() {
        let mut portal = FakePortal::new()
            .with_agreement(agreement("11111", "SysX", "SvcY", AgreementStatus::Awaiting))
            .failing_context("11111", 2);
        let policy = RetryPolicy::new(3, std::time::Duration::ZERO);
        let report = collect_snapshot(
            &mut portal,
            &[Institution::new("11111", OrganisationKind::Institution)],
            &policy,
        );
        assert!(report.errors.is_empty());
        assert!(report.missing.is_empty());
        assert_eq!(portal.context_attempts("11111"), 3);
    }

    #[test]
    fn institution_without_agreements_is_not_missing() {
        let mut portal = FakePortal::new();
        let report = collect_snapshot(
            &mut portal,
            &[Institution::new("33333", OrganisationKind::Institution)],
            &RetryPolicy::once(),
        );
        assert!(report.missing.is_empty());
        assert!(!report.has_failures());
    }

    #[test]
    fn expired_session_stops_scan_but_reports_all_missing() {
        let mut portal = FakePortal::new()
            .with_agreement(daycare_agreement("22222", "SysA", "SvcB", AgreementStatus::Approved))
            .expired_session_for("11111");
        let report = collect_snapshot(&mut portal, &institutions(), &RetryPolicy::once());
        assert!(report.aborted.is_some());
        assert_eq!(report.missing.len(), 3);
        assert_eq!(portal.context_attempts("22222"), 0);

        let log = report.error_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].error, MISSING_MESSAGE);
    }

    fn same_code_pair() -> Vec<Institution> {
        vec![
            Institution::new("12345", OrganisationKind::Institution),
            Institution::new("12345", OrganisationKind::Daycare),
        ]
    }

    #[test]
    fn failed_institution_is_missing_even_if_its_daycare_shares_the_code() {
        let mut portal = FakePortal::new()
            .with_agreement(daycare_agreement("12345", "SysA", "SvcB", AgreementStatus::Approved))
            .failing_context("12345", 1);

        let report = collect_snapshot(&mut portal, &same_code_pair(), &RetryPolicy::once());
        assert_eq!(report.snapshot.agreements.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].institution, same_code_pair()[0]);
        assert_eq!(report.missing, vec![same_code_pair()[0].clone()]);

        // Failed and missing: one log line, not two.
        let log = report.error_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].institution, same_code_pair()[0]);
    }

    #[test]
    fn missing_daycare_is_logged_next_to_failed_institution_with_same_code() {
        let entry = ErrorLogEntry {
            institution: same_code_pair()[0].clone(),
            error: "remote access failed".to_string(),
        };
        let report = CollectionReport {
            snapshot: Snapshot {
                taken_at: Utc::now(),
                agreements: Vec::new(),
            },
            errors: vec![entry],
            missing: same_code_pair(),
            aborted: None,
        };
        let log = report.error_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].institution, same_code_pair()[1]);
        assert_eq!(log[1].error, MISSING_MESSAGE);
    }

    #[test]
    fn agreements_keep_the_organisation_they_were_collected_under() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut portal = FakePortal::new()
            .with_agreement(agreement("12345", "SysX", "SvcY", AgreementStatus::Awaiting))
            .with_agreement(daycare_agreement("12345", "SysA", "SvcB", AgreementStatus::Approved));
        let mut cfg = ReconcilerConfig {
            institutions: same_code_pair(),
            ..ReconcilerConfig::default()
        };
        cfg.retry.delay_ms = 0;
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).expect("date");

        let outcome = create_overview(&mut portal, &cfg, temp.path(), date).expect("overview");
        assert!(outcome.error_log_path.is_none());
        let kinds: Vec<OrganisationKind> = outcome
            .report
            .snapshot
            .agreements
            .iter()
            .map(|agr| agr.organisation)
            .collect();
        assert_eq!(
            kinds,
            vec![OrganisationKind::Institution, OrganisationKind::Daycare]
        );
        let contents = std::fs::read_to_string(&outcome.overview_path).expect("read");
        assert!(contents.contains("Institutioner,12345,SysX,SvcY,VENTER"), "{contents}");
        assert!(contents.contains("Dagtilbud,12345,SysA,SvcB,GODKENDT"), "{contents}");
    }

    #[test]
    fn create_overview_writes_overview_and_error_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut portal = FakePortal::new()
            .with_agreement(agreement("11111", "SysX", "SvcY", AgreementStatus::Awaiting))
            .failing_context("99999", 10);
        let mut cfg = ReconcilerConfig {
            institutions: institutions(),
            ..ReconcilerConfig::default()
        };
        cfg.retry.max_attempts = 1;
        cfg.retry.delay_ms = 0;
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).expect("date");

        let outcome = create_overview(&mut portal, &cfg, temp.path(), date).expect("overview");
        assert!(outcome.overview_path.exists());
        let log_path = outcome.error_log_path.expect("error log");
        let log = std::fs::read_to_string(log_path).expect("read log");
        assert!(log.contains("99999"));
    }

    #[test]
    fn create_overview_requires_institutions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut portal = FakePortal::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).expect("date");
        let err = create_overview(&mut portal, &ReconcilerConfig::default(), temp.path(), date)
            .unwrap_err();
        assert!(err.is::<ConfigurationError>());
    }
}
