//! Diff of operator-desired state against observed remote state.

use crate::core::types::{
    Action, AgreementStatus, Directive, DirectiveSet, Institution, OrganisationKind, Snapshot,
};

/// One row of the operator-edited overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRow {
    pub institution_id: String,
    pub organisation: OrganisationKind,
    pub system_name: String,
    pub service_name: String,
    pub observed_status: AgreementStatus,
    pub action: Option<Action>,
}

/// Derive the minimal set of directives for the requested changes.
///
/// - Rows without an action are dropped.
/// - Rows whose current status already equals the action's target are dropped.
/// - With a `snapshot`, the current status comes from it when the agreement is
///   present there; otherwise the row's own `observed_status` is used.
pub fn generate_directives(rows: &[DesiredRow], snapshot: Option<&Snapshot>) -> DirectiveSet {
    let mut set = DirectiveSet::default();
    for row in rows {
        let Some(action) = row.action else {
            continue;
        };
        let observed = snapshot
            .and_then(|snap| {
                let institution = Institution::new(row.institution_id.clone(), row.organisation);
                snap.current_status(&institution, &row.system_name, &row.service_name)
            })
            .unwrap_or(row.observed_status);
        if observed == action.target_status() {
            continue;
        }
        set.push(Directive {
            institution_id: row.institution_id.clone(),
            organisation: row.organisation,
            system_name: row.system_name.clone(),
            service_name: row.service_name.clone(),
            observed_status: observed,
            action,
        });
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Agreement;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn row(service: &str, status: AgreementStatus, action: Option<Action>) -> DesiredRow {
        DesiredRow {
            institution_id: "12345".to_string(),
            organisation: OrganisationKind::Institution,
            system_name: "SysX".to_string(),
            service_name: service.to_string(),
            observed_status: status,
            action,
        }
    }

    #[test]
    fn approve_on_awaiting_row_emits_directive() {
        let rows = vec![row("SvcY", AgreementStatus::Awaiting, Some(Action::Approve))];
        let set = generate_directives(&rows, None);
        assert_eq!(set.approve.len(), 1);
        assert!(set.wait.is_empty());
        assert!(set.delete.is_empty());
        assert_eq!(set.approve[0].observed_status, AgreementStatus::Awaiting);
        assert_eq!(set.approve[0].action, Action::Approve);
    }

    #[test]
    fn rows_already_in_target_status_emit_nothing() {
        let rows = vec![
            row("A", AgreementStatus::Approved, Some(Action::Approve)),
            row("B", AgreementStatus::Awaiting, Some(Action::Wait)),
            row("C", AgreementStatus::Deleted, Some(Action::Delete)),
        ];
        assert!(generate_directives(&rows, None).is_empty());
    }

    #[test]
    fn rows_without_action_are_dropped() {
        let rows = vec![
            row("A", AgreementStatus::Awaiting, None),
            row("B", AgreementStatus::Approved, None),
        ];
        assert!(generate_directives(&rows, None).is_empty());
    }

    #[test]
    fn lists_are_disjoint_and_keep_row_order() {
        let rows = vec![
            row("A", AgreementStatus::Awaiting, Some(Action::Approve)),
            row("B", AgreementStatus::Approved, Some(Action::Delete)),
            row("C", AgreementStatus::Approved, Some(Action::Wait)),
            row("D", AgreementStatus::Awaiting, Some(Action::Approve)),
        ];
        let set = generate_directives(&rows, None);
        let approve: Vec<&str> = set.approve.iter().map(|d| d.service_name.as_str()).collect();
        assert_eq!(approve, vec!["A", "D"]);
        assert_eq!(set.delete.len(), 1);
        assert_eq!(set.wait.len(), 1);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn fresh_snapshot_overrides_stale_row_status() {
        let snapshot = Snapshot {
            taken_at: Utc::now(),
            agreements: vec![Agreement {
                institution_id: "12345".to_string(),
                organisation: OrganisationKind::Institution,
                system_name: "SysX".to_string(),
                service_name: "SvcY".to_string(),
                status: AgreementStatus::Approved,
                remote_id: "1".to_string(),
                details: BTreeMap::new(),
            }],
        };
        let rows = vec![
            row("SvcY", AgreementStatus::Awaiting, Some(Action::Approve)),
            row("Other", AgreementStatus::Awaiting, Some(Action::Approve)),
        ];
        let set = generate_directives(&rows, Some(&snapshot));
        let services: Vec<&str> = set.approve.iter().map(|d| d.service_name.as_str()).collect();
        assert_eq!(services, vec!["Other"]);
    }
}
