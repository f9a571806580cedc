//! Overview spreadsheet (CSV) reader and writers.
//!
//! The overview lives in `<base_dir>/Output/`. Exactly one overview file may
//! exist there when an upload starts; operators fill in `statusændring`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::core::directives::DesiredRow;
use crate::core::types::{
    Action, AgreementStatus, Institution, OrganisationKind, Snapshot, normalize_institution_id,
};
use crate::error::ConfigurationError;

pub const OUTPUT_DIR: &str = "Output";
pub const OVERVIEW_PREFIX: &str = "Dataaftaler_Oversigt_";
pub const ERROR_LOG_PREFIX: &str = "Error_Log_";
const OVERVIEW_MARKER: &str = "Oversigt";

pub const COL_ORGANISATION: &str = "Organisation";
pub const COL_INSTITUTION: &str = "Instregnr";
pub const COL_SYSTEM: &str = "systemNavn";
pub const COL_SERVICE: &str = "serviceNavn";
pub const COL_STATUS: &str = "status";
pub const COL_ACTION: &str = "statusændring";

const REQUIRED_COLUMNS: [&str; 5] = [
    COL_INSTITUTION,
    COL_SYSTEM,
    COL_SERVICE,
    COL_STATUS,
    COL_ACTION,
];

/// One line of the collection error log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub institution: Institution,
    pub error: String,
}

pub fn output_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(OUTPUT_DIR)
}

fn date_stamp(date: NaiveDate) -> String {
    date.format("%d%m%Y").to_string()
}

fn is_overview_file(path: &Path) -> bool {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(OVERVIEW_MARKER));
    is_csv && named && path.is_file()
}

fn overview_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if is_overview_file(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Locate the single overview file in `<base_dir>/Output`.
///
/// A missing directory, no file or more than one file is a configuration
/// error.
pub fn find_overview(base_dir: &Path) -> Result<PathBuf> {
    let dir = output_dir(base_dir);
    if !dir.is_dir() {
        return Err(ConfigurationError::new(format!(
            "overview directory {} does not exist",
            dir.display()
        ))
        .into());
    }
    let mut found = overview_files(&dir)?;
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(ConfigurationError::new(format!(
            "no overview file found in {}",
            dir.display()
        ))
        .into()),
        n => Err(ConfigurationError::new(format!(
            "expected exactly one overview file in {}, found {n}",
            dir.display()
        ))
        .into()),
    }
}

/// Parse the operator-edited overview into desired-state rows.
///
/// Rows without an action and with an unreadable status are skipped; an
/// unknown action flag or a missing column fails the whole read.
pub fn read_desired_rows(path: &Path) -> Result<Vec<DesiredRow>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| ConfigurationError::new(format!("open {}: {err}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|err| {
            ConfigurationError::new(format!("read header of {}: {err}", path.display()))
        })?
        .clone();
    let position = |name: &str| headers.iter().position(|header| header.trim() == name);

    let mut columns = BTreeMap::new();
    for name in REQUIRED_COLUMNS {
        let index = position(name).ok_or_else(|| {
            ConfigurationError::new(format!("{} is missing column '{name}'", path.display()))
        })?;
        columns.insert(name, index);
    }
    let organisation_col = position(COL_ORGANISATION);

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        // Header is line 1.
        let line = line + 2;
        let record = record.map_err(|err| {
            ConfigurationError::new(format!("{} line {line}: {err}", path.display()))
        })?;
        let cell = |name: &str| {
            columns
                .get(name)
                .and_then(|index| record.get(*index))
                .unwrap_or("")
                .trim()
        };

        let action = Action::parse_flag(cell(COL_ACTION)).map_err(|err| {
            ConfigurationError::new(format!("{} line {line}: {err}", path.display()))
        })?;
        let status = cell(COL_STATUS).parse::<AgreementStatus>();
        let observed_status = match (action, status) {
            (_, Ok(status)) => status,
            (None, Err(_)) => continue,
            (Some(_), Err(err)) => {
                return Err(ConfigurationError::new(format!(
                    "{} line {line}: {err}",
                    path.display()
                ))
                .into());
            }
        };

        let institution_id = normalize_institution_id(cell(COL_INSTITUTION));
        if institution_id.is_empty() {
            if action.is_some() {
                return Err(ConfigurationError::new(format!(
                    "{} line {line}: empty {COL_INSTITUTION}",
                    path.display()
                ))
                .into());
            }
            continue;
        }

        let organisation = match organisation_col.and_then(|index| record.get(index)) {
            Some(raw) if !raw.trim().is_empty() => {
                raw.parse::<OrganisationKind>().map_err(|err| {
                    ConfigurationError::new(format!("{} line {line}: {err}", path.display()))
                })?
            }
            _ => OrganisationKind::Institution,
        };

        rows.push(DesiredRow {
            institution_id,
            organisation,
            system_name: cell(COL_SYSTEM).to_string(),
            service_name: cell(COL_SERVICE).to_string(),
            observed_status,
            action,
        });
    }
    debug!(path = %path.display(), rows = rows.len(), "read overview");
    Ok(rows)
}

/// Write the snapshot as the new overview, replacing earlier overview files.
///
/// Rows are sorted by institution code and organisation. Each row carries the
/// organisation its agreement was collected under. Descriptive columns are
/// the union of all agreement details, in name order.
pub fn write_overview(base_dir: &Path, date: NaiveDate, snapshot: &Snapshot) -> Result<PathBuf> {
    let dir = output_dir(base_dir);
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    for old in overview_files(&dir)? {
        debug!(path = %old.display(), "removing earlier overview");
        fs::remove_file(&old).with_context(|| format!("remove {}", old.display()))?;
    }

    let detail_columns: BTreeSet<&str> = snapshot
        .agreements
        .iter()
        .flat_map(|agr| agr.details.keys().map(String::as_str))
        .collect();
    let mut agreements: Vec<_> = snapshot.agreements.iter().collect();
    agreements.sort_by(|a, b| {
        (&a.institution_id, a.organisation).cmp(&(&b.institution_id, b.organisation))
    });

    let path = dir.join(format!("{OVERVIEW_PREFIX}{}.csv", date_stamp(date)));
    let mut writer =
        csv::Writer::from_path(&path).with_context(|| format!("create {}", path.display()))?;
    let mut header = vec![COL_ORGANISATION, COL_INSTITUTION, COL_SYSTEM, COL_SERVICE, COL_STATUS];
    header.extend(detail_columns.iter().copied());
    header.push(COL_ACTION);
    writer.write_record(&header).context("write overview header")?;

    for agr in agreements {
        let mut record = vec![
            agr.organisation.as_str().to_string(),
            agr.institution_id.clone(),
            agr.system_name.clone(),
            agr.service_name.clone(),
            agr.status.as_str().to_string(),
        ];
        for column in &detail_columns {
            record.push(agr.details.get(*column).cloned().unwrap_or_default());
        }
        record.push(String::new());
        writer.write_record(&record).context("write overview row")?;
    }
    writer
        .flush()
        .with_context(|| format!("flush {}", path.display()))?;
    info!(path = %path.display(), agreements = snapshot.agreements.len(), "wrote overview");
    Ok(path)
}

/// Write collection failures next to the overview.
pub fn write_error_log(
    base_dir: &Path,
    date: NaiveDate,
    entries: &[ErrorLogEntry],
) -> Result<PathBuf> {
    let dir = output_dir(base_dir);
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    let path = dir.join(format!("{ERROR_LOG_PREFIX}{}.csv", date_stamp(date)));
    let mut writer =
        csv::Writer::from_path(&path).with_context(|| format!("create {}", path.display()))?;
    writer
        .write_record(["InstRegNr", COL_ORGANISATION, "Error"])
        .context("write error log header")?;
    for entry in entries {
        writer
            .write_record([
                entry.institution.id.as_str(),
                entry.institution.organisation.as_str(),
                entry.error.as_str(),
            ])
            .context("write error log row")?;
    }
    writer
        .flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Agreement;
    use chrono::Utc;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).expect("date")
    }

    fn write_sheet(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let output = output_dir(dir);
        fs::create_dir_all(&output).expect("mkdir");
        let path = output.join(name);
        fs::write(&path, contents).expect("write sheet");
        path
    }

    fn is_configuration_error(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<ConfigurationError>())
    }

    #[test]
    fn find_overview_requires_exactly_one_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = find_overview(temp.path()).unwrap_err();
        assert!(is_configuration_error(&err));

        write_sheet(temp.path(), "Dataaftaler_Oversigt_01012024.csv", "");
        write_sheet(temp.path(), "Error_Log_01012024.csv", "");
        let found = find_overview(temp.path()).expect("one overview");
        assert!(found.ends_with("Dataaftaler_Oversigt_01012024.csv"));

        write_sheet(temp.path(), "Dataaftaler_Oversigt_02012024.csv", "");
        let err = find_overview(temp.path()).unwrap_err();
        assert!(is_configuration_error(&err));
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn reads_rows_and_normalizes_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sheet(
            temp.path(),
            "Dataaftaler_Oversigt_01012024.csv",
            "Organisation,Instregnr,systemNavn,serviceNavn,status,Kontaktperson,statusændring\n\
             Institutioner,12345.0,SysX,SvcY,VENTER,Anne,GODKEND\n\
             Dagtilbud,22222,SysA,SvcB,GODKENDT,,\n",
        );
        let rows = read_desired_rows(&path).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].institution_id, "12345");
        assert_eq!(rows[0].action, Some(Action::Approve));
        assert_eq!(rows[0].observed_status, AgreementStatus::Awaiting);
        assert_eq!(rows[1].organisation, OrganisationKind::Daycare);
        assert_eq!(rows[1].action, None);
    }

    #[test]
    fn missing_column_is_configuration_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sheet(
            temp.path(),
            "Dataaftaler_Oversigt_01012024.csv",
            "Instregnr,systemNavn,serviceNavn,status\n12345,SysX,SvcY,VENTER\n",
        );
        let err = read_desired_rows(&path).unwrap_err();
        assert!(is_configuration_error(&err));
        assert!(err.to_string().contains("statusændring"));
    }

    #[test]
    fn unknown_action_flag_is_configuration_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_sheet(
            temp.path(),
            "Dataaftaler_Oversigt_01012024.csv",
            "Instregnr,systemNavn,serviceNavn,status,statusændring\n12345,SysX,SvcY,VENTER,MAYBE\n",
        );
        let err = read_desired_rows(&path).unwrap_err();
        assert!(is_configuration_error(&err));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn overview_replaces_earlier_files_and_sorts_rows() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_sheet(temp.path(), "Dataaftaler_Oversigt_01012024.csv", "old");

        let mut details = BTreeMap::new();
        details.insert("Kontaktperson".to_string(), "Anne".to_string());
        let snapshot = Snapshot {
            taken_at: Utc::now(),
            agreements: vec![
                Agreement {
                    institution_id: "22222".to_string(),
                    organisation: OrganisationKind::Institution,
                    system_name: "SysB".to_string(),
                    service_name: "SvcB".to_string(),
                    status: AgreementStatus::Approved,
                    remote_id: "2".to_string(),
                    details: BTreeMap::new(),
                },
                Agreement {
                    institution_id: "11111".to_string(),
                    organisation: OrganisationKind::Daycare,
                    system_name: "SysA".to_string(),
                    service_name: "SvcA".to_string(),
                    status: AgreementStatus::Awaiting,
                    remote_id: "1".to_string(),
                    details,
                },
            ],
        };
        let path = write_overview(temp.path(), date(), &snapshot).expect("write");
        assert!(path.ends_with("Dataaftaler_Oversigt_07032024.csv"));
        assert_eq!(overview_files(&output_dir(temp.path())).expect("list").len(), 1);

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "Organisation,Instregnr,systemNavn,serviceNavn,status,Kontaktperson,statusændring"
        );
        assert_eq!(lines[1], "Dagtilbud,11111,SysA,SvcA,VENTER,Anne,");
        assert_eq!(lines[2], "Institutioner,22222,SysB,SvcB,GODKENDT,,");

        // The written overview is itself a valid input.
        let rows = read_desired_rows(&path).expect("read back");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.action.is_none()));
    }

    #[test]
    fn overview_keeps_institution_and_daycare_with_same_code_apart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let row = |organisation, system: &str| Agreement {
            institution_id: "12345".to_string(),
            organisation,
            system_name: system.to_string(),
            service_name: "Svc".to_string(),
            status: AgreementStatus::Approved,
            remote_id: system.to_string(),
            details: BTreeMap::new(),
        };
        let snapshot = Snapshot {
            taken_at: Utc::now(),
            agreements: vec![
                row(OrganisationKind::Daycare, "SysD"),
                row(OrganisationKind::Institution, "SysI"),
            ],
        };
        let path = write_overview(temp.path(), date(), &snapshot).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[1], "Institutioner,12345,SysI,Svc,GODKENDT,");
        assert_eq!(lines[2], "Dagtilbud,12345,SysD,Svc,GODKENDT,");

        let rows = read_desired_rows(&path).expect("read back");
        assert_eq!(rows[0].organisation, OrganisationKind::Institution);
        assert_eq!(rows[1].organisation, OrganisationKind::Daycare);
    }

    #[test]
    fn error_log_lists_failed_institutions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = vec![ErrorLogEntry {
            institution: Institution::new("99999", OrganisationKind::Institution),
            error: "remote access failed: 503".to_string(),
        }];
        let path = write_error_log(temp.path(), date(), &entries).expect("write");
        let contents = fs::read_to_string(path).expect("read");
        assert_eq!(
            contents,
            "InstRegNr,Organisation,Error\n99999,Institutioner,remote access failed: 503\n"
        );
    }
}
