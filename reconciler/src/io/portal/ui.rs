//! UI binding of the Access Port: drives the portal's web pages through a
//! [`BrowserDriver`].
//!
//! The agreements table has no stable row ids, so `remote_id` is the row's
//! position in the table at the time it was read. The execution state machine
//! re-reads the table before every mutation, which keeps positions current.
//! An institution without agreements shows a notice instead of the table.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::types::{Agreement, AgreementStatus, AgreementView, Institution, OrganisationKind};
use crate::error::PortError;
use crate::io::config::PortalConfig;
use crate::io::portal::{AgreementPort, ExecutionContext};
use crate::io::webdriver::{BrowserDriver, Locator};

const SELECT_ORGANISATION_PATH: &str = "/tilslutning?select-organisation=true";
const AGREEMENTS_TABLE: &str = "table.stil-tabel";
const EMPTY_STATE: &str = "//*[contains(text(), 'Endnu ingen forespørgsler på dataadgange')]";
/// Either the agreements table or the empty-state notice.
const AGREEMENTS_LOADED: &str = "//table[contains(concat(' ', normalize-space(@class), ' '), \
     ' stil-tabel ')] | //*[contains(text(), 'Endnu ingen forespørgsler på dataadgange')]";
const DAYCARE_TAB: &str = "dagtilbud-tab-button";
const PROVIDER_POPUP_CLOSE: &str = "udbyder-close-button";
const ADMIN_LINK: &str = "Dataadgangadministration";
const ADD_CONTACT_LINK: &str = "Tilføj kontaktoplysninger";
const NOTIFICATION_EMAIL: &str = "notifikation-email";
const CREATE_NOTIFICATION: &str = "opret-notifikation-button";
const CLOSE_NOTIFICATION: &str = "//button[contains(text(), 'Luk')]";
const APPROVE_BUTTON: &str = "button[title=\"Sætter status til Godkendt\"]";
const AWAIT_BUTTON: &str = "button[title=\"Sætter status til Venter\"]";
const DELETE_ICON: &str = "img.tableImg.hand.dataadgang-slet[title=\"Slet dataadgang\"]";
const CONFIRM_DELETE: &str =
    "//div[@class='react-confirm-alert-button-group']/button[text()='Slet']";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiSettings {
    pub base_url: String,
    pub element_timeout: Duration,
    pub popup_timeout: Duration,
    pub system_column: usize,
    pub service_column: usize,
    pub status_column: usize,
    /// Registered as notification contact when the provider popup offers it.
    pub notification_mail: Option<String>,
}

impl UiSettings {
    pub fn from_config(portal: &PortalConfig, notification_mail: Option<String>) -> Self {
        Self {
            base_url: portal.base_url.trim_end_matches('/').to_string(),
            element_timeout: Duration::from_secs(portal.ui.element_timeout_secs),
            popup_timeout: Duration::from_secs(portal.ui.popup_timeout_secs),
            system_column: portal.ui.system_column,
            service_column: portal.ui.service_column,
            status_column: portal.ui.status_column,
            notification_mail,
        }
    }
}

pub struct UiPortal<D> {
    driver: D,
    settings: UiSettings,
}

impl<D: BrowserDriver> UiPortal<D> {
    pub fn new(driver: D, settings: UiSettings) -> Self {
        Self { driver, settings }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn table() -> Locator {
        Locator::css(AGREEMENTS_TABLE)
    }

    fn loaded() -> Locator {
        Locator::xpath(AGREEMENTS_LOADED)
    }

    fn empty_state() -> Locator {
        Locator::xpath(EMPTY_STATE)
    }

    /// Whether the page shows the notice for an institution without agreements.
    fn shows_empty_state(&mut self) -> Result<bool, PortError> {
        match self
            .driver
            .wait_for_element(&Self::empty_state(), Duration::ZERO)
        {
            Ok(()) => Ok(true),
            Err(PortError::TransientUi(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Deal with the provider popup shown after selecting an institution.
    ///
    /// A missing popup is fine; only session loss is propagated.
    fn dismiss_popup(&mut self) -> Result<(), PortError> {
        let popup = self.settings.popup_timeout;
        if let Some(mail) = self.settings.notification_mail.clone() {
            match self.driver.click(&Locator::link_text(ADD_CONTACT_LINK), popup) {
                Ok(()) => {
                    let timeout = self.settings.element_timeout;
                    self.driver
                        .type_text(&Locator::id(NOTIFICATION_EMAIL), &mail, timeout)?;
                    self.driver.click(&Locator::id(CREATE_NOTIFICATION), timeout)?;
                    let close = Locator::xpath(CLOSE_NOTIFICATION);
                    return ignore_absent(self.driver.click(&close, popup));
                }
                Err(err) if err.is_session_expired() => return Err(err),
                Err(err) => debug!(%err, "no notification contact prompt"),
            }
        }
        ignore_absent(self.driver.click(&Locator::id(PROVIDER_POPUP_CLOSE), popup))
    }

    fn row_index(agreement: &Agreement) -> Result<usize, PortError> {
        agreement.remote_id.parse::<usize>().map_err(|_| {
            PortError::NotFound(format!(
                "agreement {}/{} has no table position",
                agreement.system_name, agreement.service_name
            ))
        })
    }

    fn parse_rows(&self, institution: &Institution, rows: &[Vec<String>]) -> Vec<Agreement> {
        let settings = &self.settings;
        let mut agreements = Vec::new();
        for (index, cells) in rows.iter().enumerate() {
            let cell = |column: usize| cells.get(column).map(|text| text.trim());
            let (Some(system), Some(service), Some(raw_status)) = (
                cell(settings.system_column),
                cell(settings.service_column),
                cell(settings.status_column),
            ) else {
                warn!(row = index, "agreement row with too few cells skipped");
                continue;
            };
            let Ok(status) = raw_status.parse::<AgreementStatus>() else {
                warn!(row = index, raw_status, "agreement row with unknown status skipped");
                continue;
            };
            agreements.push(Agreement {
                institution_id: institution.id.clone(),
                organisation: institution.organisation,
                system_name: system.to_string(),
                service_name: service.to_string(),
                status,
                remote_id: index.to_string(),
                details: BTreeMap::new(),
            });
        }
        agreements
    }
}

fn ignore_absent(result: Result<(), PortError>) -> Result<(), PortError> {
    match result {
        Err(PortError::TransientUi(_)) => Ok(()),
        other => other,
    }
}

impl<D: BrowserDriver> AgreementPort for UiPortal<D> {
    #[instrument(skip_all, fields(institution = %institution.id))]
    fn open_context(&mut self, institution: &Institution) -> Result<ExecutionContext, PortError> {
        let timeout = self.settings.element_timeout;
        let url = format!("{}{}", self.settings.base_url, SELECT_ORGANISATION_PATH);
        self.driver.navigate(&url)?;
        if institution.organisation == OrganisationKind::Daycare {
            self.driver.click(&Locator::id(DAYCARE_TAB), timeout)?;
        }
        let entry = format!("//*[normalize-space(text())='{}']", institution.id);
        self.driver.click(&Locator::xpath(&entry), timeout)?;
        self.dismiss_popup()?;
        self.driver.click(&Locator::link_text(ADMIN_LINK), timeout)?;
        self.driver.wait_for_element(&Self::loaded(), timeout)?;
        Ok(ExecutionContext::new(institution.clone(), None))
    }

    #[instrument(skip_all, fields(institution = %ctx.institution.id))]
    fn list_agreements(&mut self, ctx: &ExecutionContext) -> Result<AgreementView, PortError> {
        self.driver
            .wait_for_element(&Self::loaded(), self.settings.element_timeout)?;
        if self.shows_empty_state()? {
            debug!("institution has no agreements");
            return Ok(AgreementView::new(Vec::new()));
        }
        let rows = self
            .driver
            .read_table(&Self::table(), self.settings.element_timeout)?;
        let agreements = self.parse_rows(&ctx.institution, &rows);
        debug!(count = agreements.len(), "read agreements table");
        Ok(AgreementView::new(agreements))
    }

    fn request_status_change(
        &mut self,
        _ctx: &ExecutionContext,
        agreement: &Agreement,
        desired: AgreementStatus,
    ) -> Result<(), PortError> {
        let button = match desired {
            AgreementStatus::Approved => APPROVE_BUTTON,
            AgreementStatus::Awaiting => AWAIT_BUTTON,
            AgreementStatus::Deleted => {
                return Err(PortError::Access(
                    "deletion is not a status change".to_string(),
                ));
            }
        };
        let row = Self::row_index(agreement)?;
        self.driver.click_in_row(
            &Self::table(),
            row,
            &Locator::css(button),
            self.settings.element_timeout,
        )
    }

    fn request_delete(
        &mut self,
        _ctx: &ExecutionContext,
        agreement: &Agreement,
    ) -> Result<(), PortError> {
        let row = Self::row_index(agreement)?;
        let timeout = self.settings.element_timeout;
        self.driver
            .click_in_row(&Self::table(), row, &Locator::css(DELETE_ICON), timeout)?;
        self.driver.click(&Locator::xpath(CONFIRM_DELETE), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every driver call; clicks on `absent` locators time out.
    #[derive(Default)]
    struct RecordingDriver {
        calls: Vec<String>,
        absent: Vec<Locator>,
        table: Vec<Vec<String>>,
    }

    impl BrowserDriver for RecordingDriver {
        fn navigate(&mut self, url: &str) -> Result<(), PortError> {
            self.calls.push(format!("navigate {url}"));
            Ok(())
        }

        fn click(&mut self, locator: &Locator, _timeout: Duration) -> Result<(), PortError> {
            self.calls.push(format!("click {locator:?}"));
            if self.absent.contains(locator) {
                return Err(PortError::TransientUi("absent".to_string()));
            }
            Ok(())
        }

        fn wait_for_element(
            &mut self,
            locator: &Locator,
            _timeout: Duration,
        ) -> Result<(), PortError> {
            self.calls.push(format!("wait {locator:?}"));
            if self.absent.contains(locator) {
                return Err(PortError::TransientUi("absent".to_string()));
            }
            Ok(())
        }

        fn type_text(
            &mut self,
            locator: &Locator,
            text: &str,
            _timeout: Duration,
        ) -> Result<(), PortError> {
            self.calls.push(format!("type {locator:?} {text}"));
            Ok(())
        }

        fn read_table(
            &mut self,
            table: &Locator,
            _timeout: Duration,
        ) -> Result<Vec<Vec<String>>, PortError> {
            self.calls.push(format!("read {table:?}"));
            if self.absent.contains(table) {
                return Err(PortError::TransientUi("absent".to_string()));
            }
            Ok(self.table.clone())
        }

        fn click_in_row(
            &mut self,
            _table: &Locator,
            row: usize,
            target: &Locator,
            _timeout: Duration,
        ) -> Result<(), PortError> {
            self.calls.push(format!("row {row} click {target:?}"));
            Ok(())
        }
    }

    fn settings(mail: Option<&str>) -> UiSettings {
        UiSettings::from_config(&PortalConfig::default(), mail.map(str::to_string))
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(Institution::new("12345", OrganisationKind::Institution), None)
    }

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn daycare_context_clicks_tab_and_closes_popup() {
        let mut portal = UiPortal::new(RecordingDriver::default(), settings(None));
        let ctx = portal
            .open_context(&Institution::new("12345", OrganisationKind::Daycare))
            .expect("context");
        assert_eq!(ctx.institution.id, "12345");

        let calls = &portal.driver().calls;
        assert!(calls[0].starts_with("navigate https://tilslutning.stil.dk/tilslutning"));
        assert!(calls[1].contains(DAYCARE_TAB));
        assert!(calls[2].contains("normalize-space(text())='12345'"));
        assert!(calls[3].contains(PROVIDER_POPUP_CLOSE));
        assert!(calls[4].contains(ADMIN_LINK));
        assert!(calls[5].starts_with("wait") && calls[5].contains("Endnu ingen"));
    }

    #[test]
    fn institution_code_must_match_whole_entry_text() {
        let mut portal = UiPortal::new(RecordingDriver::default(), settings(None));
        portal
            .open_context(&Institution::new("123", OrganisationKind::Institution))
            .expect("context");
        let entry = Locator::xpath("//*[normalize-space(text())='123']");
        assert_eq!(portal.driver().calls[1], format!("click {entry:?}"));
    }

    #[test]
    fn empty_agreement_page_opens_and_lists_nothing() {
        // Fresh institution: only the notice, no table.
        let driver = RecordingDriver {
            absent: vec![UiPortal::<RecordingDriver>::table()],
            table: vec![cells(&["SysX", "SvcY", "VENTER"])],
            ..RecordingDriver::default()
        };
        let mut portal = UiPortal::new(driver, settings(None));
        let ctx = portal
            .open_context(&Institution::new("12345", OrganisationKind::Institution))
            .expect("context");
        let view = portal.list_agreements(&ctx).expect("list");
        assert!(view.is_empty());
        assert!(!portal.driver().calls.iter().any(|c| c.starts_with("read")));
    }

    #[test]
    fn missing_popup_does_not_fail_context() {
        let driver = RecordingDriver {
            absent: vec![Locator::id(PROVIDER_POPUP_CLOSE)],
            ..RecordingDriver::default()
        };
        let mut portal = UiPortal::new(driver, settings(None));
        portal
            .open_context(&Institution::new("12345", OrganisationKind::Institution))
            .expect("context");
        assert!(!portal.driver().calls.iter().any(|c| c.contains(DAYCARE_TAB)));
    }

    #[test]
    fn notification_mail_is_registered_when_prompted() {
        let driver = RecordingDriver::default();
        let mut portal = UiPortal::new(driver, settings(Some("it@example.dk")));
        portal
            .open_context(&Institution::new("12345", OrganisationKind::Institution))
            .expect("context");
        let calls = &portal.driver().calls;
        assert!(calls.iter().any(|c| c.contains("type") && c.contains("it@example.dk")));
        assert!(calls.iter().any(|c| c.contains(CREATE_NOTIFICATION)));
        assert!(!calls.iter().any(|c| c.contains(PROVIDER_POPUP_CLOSE)));
    }

    #[test]
    fn table_rows_become_agreements_with_positions() {
        let driver = RecordingDriver {
            absent: vec![UiPortal::<RecordingDriver>::empty_state()],
            table: vec![
                cells(&["SysX", "SvcY", "VENTER"]),
                cells(&["only one cell"]),
                cells(&["SysA", "SvcB", "GODKENDT"]),
            ],
            ..RecordingDriver::default()
        };
        let mut portal = UiPortal::new(driver, settings(None));
        let ctx = context();
        let view = portal.list_agreements(&ctx).expect("list");
        assert_eq!(view.len(), 2);
        assert_eq!(view.agreements[0].remote_id, "0");
        assert_eq!(view.agreements[1].remote_id, "2");
        assert_eq!(view.agreements[1].status, AgreementStatus::Approved);
    }

    #[test]
    fn mutations_click_row_buttons() {
        let mut portal = UiPortal::new(RecordingDriver::default(), settings(None));
        let ctx = context();
        let agreement = Agreement {
            institution_id: "12345".to_string(),
            organisation: OrganisationKind::Institution,
            system_name: "SysX".to_string(),
            service_name: "SvcY".to_string(),
            status: AgreementStatus::Awaiting,
            remote_id: "3".to_string(),
            details: BTreeMap::new(),
        };
        portal
            .request_status_change(&ctx, &agreement, AgreementStatus::Approved)
            .expect("approve");
        portal.request_delete(&ctx, &agreement).expect("delete");

        let calls = &portal.driver().calls;
        assert!(calls[0].starts_with("row 3") && calls[0].contains("Godkendt"));
        assert!(calls[1].starts_with("row 3") && calls[1].contains("dataadgang-slet"));
        assert!(calls[2].contains("react-confirm-alert-button-group"));
    }
}
