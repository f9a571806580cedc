//! Test-only helpers: an in-memory portal and a scratch base directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::types::{
    Action, Agreement, AgreementStatus, AgreementView, Directive, Institution, OrganisationKind,
};
use crate::error::PortError;
use crate::io::atomic::write_atomic;
use crate::io::config::{CONFIG_FILE_NAME, ReconcilerConfig};
use crate::io::portal::{AgreementPort, ExecutionContext};
use crate::io::sheet::{OUTPUT_DIR, OVERVIEW_PREFIX};

/// Create a deterministic agreement of a regular institution with no
/// descriptive columns.
pub fn agreement(
    institution_id: &str,
    system_name: &str,
    service_name: &str,
    status: AgreementStatus,
) -> Agreement {
    agreement_under(
        &Institution::new(institution_id, OrganisationKind::Institution),
        system_name,
        service_name,
        status,
    )
}

/// Same as [`agreement`], listed under a daycare.
pub fn daycare_agreement(
    institution_id: &str,
    system_name: &str,
    service_name: &str,
    status: AgreementStatus,
) -> Agreement {
    agreement_under(
        &Institution::new(institution_id, OrganisationKind::Daycare),
        system_name,
        service_name,
        status,
    )
}

fn agreement_under(
    institution: &Institution,
    system_name: &str,
    service_name: &str,
    status: AgreementStatus,
) -> Agreement {
    let institution_id = institution.id.as_str();
    Agreement {
        institution_id: institution_id.to_string(),
        organisation: institution.organisation,
        system_name: system_name.to_string(),
        service_name: service_name.to_string(),
        status,
        remote_id: format!(
            "{institution_id}/{}/{system_name}/{service_name}/{status}",
            institution.organisation
        ),
        details: BTreeMap::new(),
    }
}

/// Create a directive for a regular institution.
pub fn directive(
    institution_id: &str,
    system_name: &str,
    service_name: &str,
    observed_status: AgreementStatus,
    action: Action,
) -> Directive {
    Directive {
        institution_id: institution_id.to_string(),
        organisation: OrganisationKind::Institution,
        system_name: system_name.to_string(),
        service_name: service_name.to_string(),
        observed_status,
        action,
    }
}

/// In-memory portal with scripted failures.
///
/// Mutations apply immediately unless [`FakePortal::ignoring_mutations`] or
/// [`FakePortal::reflecting_after`] is set. Agreements keep their `remote_id`
/// across status changes. Listings only return agreements of the exact
/// institution and organisation the context was opened for.
#[derive(Debug, Clone, Default)]
pub struct FakePortal {
    agreements: Vec<Agreement>,
    reflect_after: Option<u32>,
    pending: Vec<PendingChange>,
    context_failures: BTreeMap<String, u32>,
    list_failures: BTreeMap<String, u32>,
    expired: BTreeSet<String>,
    ignore_mutations: bool,
    context_attempts: BTreeMap<String, u32>,
    mutations: Vec<String>,
}

/// Accepted mutation not yet visible in listings.
#[derive(Debug, Clone)]
struct PendingChange {
    remote_id: String,
    status: AgreementStatus,
    listings_left: u32,
}

impl FakePortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agreement(mut self, agreement: Agreement) -> Self {
        self.agreements.push(agreement);
        self
    }

    /// The next `times` context openings for `institution_id` fail with an
    /// access error.
    pub fn failing_context(mut self, institution_id: &str, times: u32) -> Self {
        self.context_failures.insert(institution_id.to_string(), times);
        self
    }

    /// The next `times` agreement listings for `institution_id` fail with a
    /// transient UI error.
    pub fn failing_list(mut self, institution_id: &str, times: u32) -> Self {
        self.list_failures.insert(institution_id.to_string(), times);
        self
    }

    /// Opening `institution_id` reports an expired session.
    pub fn expired_session_for(mut self, institution_id: &str) -> Self {
        self.expired.insert(institution_id.to_string());
        self
    }

    /// Accept mutation requests without changing anything.
    pub fn ignoring_mutations(mut self) -> Self {
        self.ignore_mutations = true;
        self
    }

    /// Accepted mutations stay invisible for the next `listings` agreement
    /// listings and show up in the one after.
    pub fn reflecting_after(mut self, listings: u32) -> Self {
        self.reflect_after = Some(listings);
        self
    }

    pub fn context_attempts(&self, institution_id: &str) -> u32 {
        self.context_attempts
            .get(institution_id)
            .copied()
            .unwrap_or(0)
    }

    /// Status of the first record for the pair.
    pub fn status_of(
        &self,
        institution_id: &str,
        system_name: &str,
        service_name: &str,
    ) -> Option<AgreementStatus> {
        self.agreements
            .iter()
            .find(|agr| {
                agr.institution_id == institution_id && agr.is_for(system_name, service_name)
            })
            .map(|agr| agr.status)
    }

    /// Mutation requests received, as `"<remote_id> -> <status>"`.
    pub fn mutations(&self) -> &[String] {
        &self.mutations
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.len()
    }

    fn take_failure(failures: &mut BTreeMap<String, u32>, institution_id: &str) -> bool {
        match failures.get_mut(institution_id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn apply(&mut self, agreement: &Agreement, status: AgreementStatus) -> Result<(), PortError> {
        self.mutations
            .push(format!("{} -> {status}", agreement.remote_id));
        let record = self
            .agreements
            .iter_mut()
            .find(|agr| agr.remote_id == agreement.remote_id)
            .ok_or_else(|| PortError::NotFound(agreement.remote_id.clone()))?;
        if self.ignore_mutations {
            return Ok(());
        }
        match self.reflect_after {
            Some(listings) if listings > 0 => self.pending.push(PendingChange {
                remote_id: record.remote_id.clone(),
                status,
                listings_left: listings,
            }),
            _ => record.status = status,
        }
        Ok(())
    }

    /// Count one listing against every pending change and apply the ones
    /// that are due.
    fn settle_pending(&mut self) {
        let mut still_pending = Vec::new();
        for mut change in std::mem::take(&mut self.pending) {
            if change.listings_left > 0 {
                change.listings_left -= 1;
                still_pending.push(change);
                continue;
            }
            if let Some(record) = self
                .agreements
                .iter_mut()
                .find(|agr| agr.remote_id == change.remote_id)
            {
                record.status = change.status;
            }
        }
        self.pending = still_pending;
    }
}

impl AgreementPort for FakePortal {
    fn open_context(&mut self, institution: &Institution) -> Result<ExecutionContext, PortError> {
        *self
            .context_attempts
            .entry(institution.id.clone())
            .or_insert(0) += 1;
        if self.expired.contains(&institution.id) {
            return Err(PortError::SessionExpired("session cookie rejected".to_string()));
        }
        if Self::take_failure(&mut self.context_failures, &institution.id) {
            return Err(PortError::Access(format!(
                "institution {} could not be selected",
                institution.id
            )));
        }
        Ok(ExecutionContext::new(institution.clone(), None))
    }

    fn list_agreements(&mut self, ctx: &ExecutionContext) -> Result<AgreementView, PortError> {
        if Self::take_failure(&mut self.list_failures, &ctx.institution.id) {
            return Err(PortError::TransientUi("agreement table not visible".to_string()));
        }
        self.settle_pending();
        Ok(AgreementView::new(
            self.agreements
                .iter()
                .filter(|agr| agr.belongs_to(&ctx.institution))
                .cloned()
                .collect(),
        ))
    }

    fn request_status_change(
        &mut self,
        _ctx: &ExecutionContext,
        agreement: &Agreement,
        desired: AgreementStatus,
    ) -> Result<(), PortError> {
        self.apply(agreement, desired)
    }

    fn request_delete(
        &mut self,
        _ctx: &ExecutionContext,
        agreement: &Agreement,
    ) -> Result<(), PortError> {
        self.apply(agreement, AgreementStatus::Deleted)
    }
}

/// Scratch base directory for end-to-end runs.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join(CONFIG_FILE_NAME)
    }

    /// Validate `cfg` and write it as the workspace's `reconciler.toml`.
    pub fn write_config(&self, cfg: &ReconcilerConfig) -> Result<PathBuf> {
        cfg.validate()?;
        let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
        buf.push('\n');
        let path = self.config_path();
        write_atomic(&path, &buf)?;
        Ok(path)
    }

    /// Write an operator-edited overview sheet into `Output/`.
    pub fn write_overview(&self, contents: &str) -> Result<PathBuf> {
        let dir = self.path().join(OUTPUT_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{OVERVIEW_PREFIX}01012024.csv"));
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
