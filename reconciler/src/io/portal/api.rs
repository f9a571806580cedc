//! HTTP binding of the Access Port against the portal's JSON backend.
//!
//! Authentication happens out of band; the login step leaves the base
//! cookies and the XSRF token in a session file that [`load_session`] reads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::{Agreement, AgreementStatus, AgreementView, Institution, OrganisationKind};
use crate::error::{ConfigurationError, PortError};
use crate::io::portal::{AgreementPort, ExecutionContext};

const ORGANISATIONS_PATH: &str = "/tilslutningBE/organisationer";
const ACTIVE_ORGANISATION_PATH: &str = "/tilslutningBE/active-organisation";
const AGREEMENTS_PATH: &str = "/dataadgangadmBE/api/adgang/hent";
const SET_STATUS_PATH: &str = "/dataadgangadmBE/api/adgang/setStatus";
const DELETE_PATH: &str = "/dataadgangadmBE/api/adgang/slet";

const SYSTEM_FIELD: &str = "udbyderSystemOgUdbyder";
const SERVICE_FIELD: &str = "stilService";
/// Flattened fields that already have their own overview column.
const CORE_FIELDS: [&str; 3] = [
    "aktuelStatus",
    "udbyderSystemOgUdbyder_navn",
    "stilService_servicenavn",
];

/// Cookies captured by the login step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookies {
    /// `name=value;` pairs sent with every request.
    pub cookie: String,
    pub xsrf_token: String,
}

pub fn load_session(path: &Path) -> Result<SessionCookies> {
    if !path.exists() {
        return Err(ConfigurationError::new(format!(
            "session file {} does not exist; log in first",
            path.display()
        ))
        .into());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let session: SessionCookies = serde_json::from_str(&contents)
        .map_err(|err| ConfigurationError::new(format!("parse {}: {err}", path.display())))?;
    if session.cookie.trim().is_empty() || session.xsrf_token.trim().is_empty() {
        return Err(ConfigurationError::new(format!(
            "session file {} has empty cookie or xsrf_token",
            path.display()
        ))
        .into());
    }
    Ok(session)
}

pub struct HttpPortal {
    agent: ureq::Agent,
    base_url: String,
    session: SessionCookies,
    organisations: Option<BTreeMap<(OrganisationKind, String), Value>>,
}

impl HttpPortal {
    pub fn new(base_url: &str, timeout: Duration, session: SessionCookies) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            organisations: None,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn cookie_header(&self, ctx: Option<&ExecutionContext>) -> String {
        match ctx.and_then(|ctx| ctx.session.as_deref()) {
            Some(extra) if !extra.is_empty() => {
                format!("{};{}", self.session.cookie.trim_end_matches(';'), extra)
            }
            _ => self.session.cookie.clone(),
        }
    }

    fn get_json(&self, path: &str, ctx: Option<&ExecutionContext>) -> Result<Value, PortError> {
        let response = self
            .agent
            .get(&self.url(path))
            .header("cookie", self.cookie_header(ctx).as_str())
            .header("x-xsrf-token", self.session.xsrf_token.as_str())
            .header("accept", "application/json")
            .call()
            .map_err(|err| map_error(err, path))?;
        response
            .into_body()
            .read_json::<Value>()
            .map_err(|err| PortError::Access(format!("{path}: invalid JSON response: {err}")))
    }

    fn organisation_entry(&mut self, institution: &Institution) -> Result<Value, PortError> {
        if self.organisations.is_none() {
            let value = self.get_json(ORGANISATIONS_PATH, None)?;
            let parsed = parse_organisations(&value)?;
            debug!(count = parsed.len(), "cached organisation list");
            self.organisations = Some(parsed);
        }
        self.organisations
            .as_ref()
            .and_then(|orgs| orgs.get(&(institution.organisation, institution.id.clone())))
            .cloned()
            .ok_or_else(|| {
                PortError::Access(format!(
                    "institution {} is not listed under {}",
                    institution.id, institution.organisation
                ))
            })
    }
}

impl AgreementPort for HttpPortal {
    #[instrument(skip_all, fields(institution = %institution.id))]
    fn open_context(&mut self, institution: &Institution) -> Result<ExecutionContext, PortError> {
        let entry = self.organisation_entry(institution)?;
        let response = self
            .agent
            .post(&self.url(ACTIVE_ORGANISATION_PATH))
            .header("cookie", self.session.cookie.as_str())
            .header("x-xsrf-token", self.session.xsrf_token.as_str())
            .header("accept", "application/json")
            .send_json(&entry)
            .map_err(|err| map_error(err, ACTIVE_ORGANISATION_PATH))?;
        let cookies: Vec<&str> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        let session = context_cookie(&cookies);
        debug!(has_cookie = session.is_some(), "organisation selected");
        Ok(ExecutionContext::new(institution.clone(), session))
    }

    #[instrument(skip_all, fields(institution = %ctx.institution.id))]
    fn list_agreements(&mut self, ctx: &ExecutionContext) -> Result<AgreementView, PortError> {
        let value = self.get_json(AGREEMENTS_PATH, Some(ctx))?;
        let agreements = parse_agreements(&ctx.institution, &value)?;
        debug!(count = agreements.len(), "listed agreements");
        Ok(AgreementView::new(agreements))
    }

    #[instrument(
        skip_all,
        fields(institution = %ctx.institution.id, remote_id = %agreement.remote_id)
    )]
    fn request_status_change(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
        desired: AgreementStatus,
    ) -> Result<(), PortError> {
        let body = json!({
            "aftaleid": remote_id_json(&agreement.remote_id),
            "status": desired.as_str(),
            "kommentar": Value::Null,
        });
        self.agent
            .post(&self.url(SET_STATUS_PATH))
            .header("cookie", self.cookie_header(Some(ctx)).as_str())
            .header("x-xsrf-token", self.session.xsrf_token.as_str())
            .header("accept", "application/json")
            .send_json(&body)
            .map_err(|err| map_error(err, SET_STATUS_PATH))?;
        Ok(())
    }

    #[instrument(
        skip_all,
        fields(institution = %ctx.institution.id, remote_id = %agreement.remote_id)
    )]
    fn request_delete(
        &mut self,
        ctx: &ExecutionContext,
        agreement: &Agreement,
    ) -> Result<(), PortError> {
        let path = format!("{DELETE_PATH}/{}", agreement.remote_id);
        self.agent
            .delete(&self.url(&path))
            .header("cookie", self.cookie_header(Some(ctx)).as_str())
            .header("x-xsrf-token", self.session.xsrf_token.as_str())
            .call()
            .map_err(|err| map_error(err, &path))?;
        Ok(())
    }
}

fn map_error(err: ureq::Error, path: &str) -> PortError {
    match err {
        ureq::Error::StatusCode(code @ (401 | 403)) => {
            PortError::SessionExpired(format!("{path}: HTTP {code}"))
        }
        ureq::Error::StatusCode(code) => PortError::Access(format!("{path}: HTTP {code}")),
        other => PortError::Access(format!("{path}: {other}")),
    }
}

/// `name=value` pairs of `Set-Cookie` headers, joined for a `Cookie` header.
fn context_cookie(set_cookie: &[&str]) -> Option<String> {
    let pairs: Vec<&str> = set_cookie
        .iter()
        .filter_map(|header| header.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join(";"))
    }
}

/// Agreement ids are numeric on the wire; keep anything else as a string.
fn remote_id_json(remote_id: &str) -> Value {
    remote_id
        .parse::<i64>()
        .map_or_else(|_| Value::String(remote_id.to_string()), Value::from)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn parse_organisations(
    value: &Value,
) -> Result<BTreeMap<(OrganisationKind, String), Value>, PortError> {
    let mut orgs = BTreeMap::new();
    for (field, kind) in [
        ("institutioner", OrganisationKind::Institution),
        ("dagtilbud", OrganisationKind::Daycare),
    ] {
        let entries = value
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| PortError::Access(format!("organisation list lacks '{field}'")))?;
        for entry in entries {
            let Some(code) = entry.get("kode").map(scalar_text) else {
                continue;
            };
            orgs.insert((kind, code), entry.clone());
        }
    }
    Ok(orgs)
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}_{key}")
                };
                flatten_into(&name, nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), scalar_text(other));
        }
    }
}

fn parse_agreements(
    institution: &Institution,
    value: &Value,
) -> Result<Vec<Agreement>, PortError> {
    let records = value
        .as_array()
        .ok_or_else(|| PortError::Access("agreement list is not an array".to_string()))?;
    let mut agreements = Vec::with_capacity(records.len());
    for record in records {
        let service = record.get(SERVICE_FIELD).unwrap_or(&Value::Null);
        if service.is_null() {
            continue;
        }
        let Some(remote_id) = record.get("id").map(scalar_text) else {
            warn!("agreement record without id skipped");
            continue;
        };
        let raw_status = record.get("aktuelStatus").map(scalar_text).unwrap_or_default();
        let status = match raw_status.parse::<AgreementStatus>() {
            Ok(status) => status,
            Err(err) => {
                warn!(%remote_id, %err, "agreement record skipped");
                continue;
            }
        };
        let system_name = record
            .get(SYSTEM_FIELD)
            .and_then(|system| system.get("navn"))
            .map(scalar_text)
            .unwrap_or_default();
        let service_name = service.get("servicenavn").map(scalar_text).unwrap_or_default();

        let mut details = BTreeMap::new();
        flatten_into("", record, &mut details);
        for core_field in CORE_FIELDS {
            details.remove(core_field);
        }

        agreements.push(Agreement {
            institution_id: institution.id.clone(),
            organisation: institution.organisation,
            system_name,
            service_name,
            status,
            remote_id,
            details,
        });
    }
    Ok(agreements)
}
