//! Shared deterministic types for agreement reconciliation.
//!
//! Wire names (the Danish status and action words used by the portal and the
//! operator spreadsheet) live here and nowhere else.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status of an agreement as shown by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgreementStatus {
    #[serde(rename = "VENTER")]
    Awaiting,
    #[serde(rename = "GODKENDT")]
    Approved,
    #[serde(rename = "SLETTET")]
    Deleted,
}

impl AgreementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Awaiting => "VENTER",
            Self::Approved => "GODKENDT",
            Self::Deleted => "SLETTET",
        }
    }
}

impl fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgreementStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_uppercase().as_str() {
            "VENTER" => Ok(Self::Awaiting),
            "GODKENDT" => Ok(Self::Approved),
            "SLETTET" => Ok(Self::Deleted),
            other => Err(format!("unknown agreement status '{other}'")),
        }
    }
}

/// Operator-requested change, as entered in the `statusændring` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "GODKEND")]
    Approve,
    #[serde(rename = "VENT")]
    Wait,
    #[serde(rename = "SLET")]
    Delete,
}

impl Action {
    /// Upload order of the per-action batches.
    pub const ALL: [Action; 3] = [Action::Approve, Action::Delete, Action::Wait];

    pub fn as_flag(self) -> &'static str {
        match self {
            Self::Approve => "GODKEND",
            Self::Wait => "VENT",
            Self::Delete => "SLET",
        }
    }

    /// Prefix of queue references for this action.
    pub fn reference_prefix(self) -> &'static str {
        match self {
            Self::Approve => "Godkend",
            Self::Wait => "Vent",
            Self::Delete => "Slet",
        }
    }

    pub fn target_status(self) -> AgreementStatus {
        match self {
            Self::Approve => AgreementStatus::Approved,
            Self::Wait => AgreementStatus::Awaiting,
            Self::Delete => AgreementStatus::Deleted,
        }
    }

    /// Statuses from which the portal accepts this action.
    pub fn accepts_pre_state(self, status: AgreementStatus) -> bool {
        match self {
            Self::Approve => status == AgreementStatus::Awaiting,
            Self::Wait => status == AgreementStatus::Approved,
            Self::Delete => status != AgreementStatus::Deleted,
        }
    }

    /// Queue message recorded when the change was applied by this run.
    pub fn success_message(self) -> &'static str {
        match self {
            Self::Approve => "agreement approved",
            Self::Wait => "agreement set to awaiting",
            Self::Delete => "agreement deleted",
        }
    }

    /// Parse an operator flag. Empty cells mean "no change".
    pub fn parse_flag(raw: &str) -> Result<Option<Self>, String> {
        match raw.trim().to_uppercase().as_str() {
            "" => Ok(None),
            "GODKEND" => Ok(Some(Self::Approve)),
            "VENT" => Ok(Some(Self::Wait)),
            "SLET" => Ok(Some(Self::Delete)),
            other => Err(format!(
                "unknown status change '{other}' (expected GODKEND, SLET, VENT or empty)"
            )),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

/// Tab an institution is listed under in the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrganisationKind {
    #[serde(rename = "Institutioner")]
    Institution,
    #[serde(rename = "Dagtilbud")]
    Daycare,
}

impl OrganisationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Institution => "Institutioner",
            Self::Daycare => "Dagtilbud",
        }
    }
}

impl fmt::Display for OrganisationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganisationKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "Institutioner" => Ok(Self::Institution),
            "Dagtilbud" => Ok(Self::Daycare),
            other => Err(format!("unknown organisation '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Institution {
    pub id: String,
    pub organisation: OrganisationKind,
}

impl Institution {
    pub fn new(id: impl Into<String>, organisation: OrganisationKind) -> Self {
        Self {
            id: id.into(),
            organisation,
        }
    }
}

/// Composite identity of an agreement.
///
/// Status is part of the key because the snapshot view carries no identifier
/// that is independent of status. Use [`Agreement::remote_id`] for mutations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgreementKey {
    pub institution_id: String,
    pub system_name: String,
    pub service_name: String,
    pub status: AgreementStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub institution_id: String,
    /// Portal tab the agreement was read under.
    pub organisation: OrganisationKind,
    pub system_name: String,
    pub service_name: String,
    pub status: AgreementStatus,
    /// Opaque handle the binding needs to mutate this agreement.
    pub remote_id: String,
    /// Descriptive columns carried through to the overview unchanged.
    pub details: BTreeMap<String, String>,
}

impl Agreement {
    pub fn key(&self) -> AgreementKey {
        AgreementKey {
            institution_id: self.institution_id.clone(),
            system_name: self.system_name.clone(),
            service_name: self.service_name.clone(),
            status: self.status,
        }
    }

    pub fn belongs_to(&self, institution: &Institution) -> bool {
        self.institution_id == institution.id && self.organisation == institution.organisation
    }

    pub fn is_for(&self, system_name: &str, service_name: &str) -> bool {
        self.system_name == system_name && self.service_name == service_name
    }
}

/// All agreements of one institution at the moment it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreementView {
    pub agreements: Vec<Agreement>,
}

impl AgreementView {
    pub fn new(agreements: Vec<Agreement>) -> Self {
        Self { agreements }
    }

    pub fn find(
        &self,
        system_name: &str,
        service_name: &str,
        status: AgreementStatus,
    ) -> Option<&Agreement> {
        self.agreements
            .iter()
            .find(|agr| agr.is_for(system_name, service_name) && agr.status == status)
    }

    /// True when any non-deleted record exists for the system/service pair.
    pub fn has_live(&self, system_name: &str, service_name: &str) -> bool {
        self.agreements.iter().any(|agr| {
            agr.is_for(system_name, service_name) && agr.status != AgreementStatus::Deleted
        })
    }

    /// Composite-key mapping. On key collisions the first record wins.
    pub fn keyed(&self) -> BTreeMap<AgreementKey, &Agreement> {
        let mut map = BTreeMap::new();
        for agr in &self.agreements {
            map.entry(agr.key()).or_insert(agr);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.agreements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agreements.is_empty()
    }
}

/// Agreements across all institutions at collection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub agreements: Vec<Agreement>,
}

impl Snapshot {
    /// Current status of a system/service pair. Live records are preferred
    /// over deleted history entries.
    pub fn current_status(
        &self,
        institution: &Institution,
        system_name: &str,
        service_name: &str,
    ) -> Option<AgreementStatus> {
        let mut matching = self
            .agreements
            .iter()
            .filter(|agr| agr.belongs_to(institution) && agr.is_for(system_name, service_name));
        let first = matching.next()?;
        if first.status != AgreementStatus::Deleted {
            return Some(first.status);
        }
        Some(
            matching
                .find(|agr| agr.status != AgreementStatus::Deleted)
                .map_or(first.status, |agr| agr.status),
        )
    }
}

/// Intended state transition of one agreement.
///
/// Serialised with the spreadsheet column names; this is the queue payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Directive {
    #[serde(rename = "Instregnr")]
    pub institution_id: String,
    #[serde(rename = "Organisation")]
    pub organisation: OrganisationKind,
    #[serde(rename = "systemNavn")]
    pub system_name: String,
    #[serde(rename = "serviceNavn")]
    pub service_name: String,
    #[serde(rename = "status")]
    pub observed_status: AgreementStatus,
    #[serde(rename = "statusændring")]
    pub action: Action,
}

impl Directive {
    pub fn target_status(&self) -> AgreementStatus {
        self.action.target_status()
    }

    pub fn institution(&self) -> Institution {
        Institution::new(self.institution_id.clone(), self.organisation)
    }
}

/// Directives split per action class, row order preserved within each list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveSet {
    pub approve: Vec<Directive>,
    pub wait: Vec<Directive>,
    pub delete: Vec<Directive>,
}

impl DirectiveSet {
    pub fn list(&self, action: Action) -> &[Directive] {
        match action {
            Action::Approve => &self.approve,
            Action::Wait => &self.wait,
            Action::Delete => &self.delete,
        }
    }

    pub fn push(&mut self, directive: Directive) {
        match directive.action {
            Action::Approve => self.approve.push(directive),
            Action::Wait => self.wait.push(directive),
            Action::Delete => self.delete.push(directive),
        }
    }

    pub fn len(&self) -> usize {
        self.approve.len() + self.wait.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    New,
    InProgress,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_uppercase().replace('-', "_").as_str() {
            "NEW" => Ok(Self::New),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown queue status '{other}'")),
        }
    }
}

/// Strip the `.0` suffix spreadsheet tools add when a numeric column is
/// coerced to float.
pub fn normalize_institution_id(raw: &str) -> String {
    static FRACTIONAL_ARTIFACT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\d+)\.0+$").unwrap());
    let trimmed = raw.trim();
    match FRACTIONAL_ARTIFACT.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}
