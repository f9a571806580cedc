//! Browser automation seam and its W3C WebDriver implementation.
//!
//! [`WebDriverClient`] attaches to a session that is already logged in to the
//! portal; it never creates or ends sessions. Element waits poll until their
//! timeout and then fail with [`PortError::TransientUi`].

use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use crate::core::retry::wait_until;
use crate::error::PortError;

/// W3C key of an element reference in command responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Id(String),
    Css(String),
    XPath(String),
    LinkText(String),
}

impl Locator {
    pub fn id(value: &str) -> Self {
        Self::Id(value.to_string())
    }

    pub fn css(value: &str) -> Self {
        Self::Css(value.to_string())
    }

    pub fn xpath(value: &str) -> Self {
        Self::XPath(value.to_string())
    }

    pub fn link_text(value: &str) -> Self {
        Self::LinkText(value.to_string())
    }

    /// W3C location strategy and selector.
    fn strategy(&self) -> (&'static str, String) {
        match self {
            Self::Id(id) => ("css selector", format!("[id=\"{id}\"]")),
            Self::Css(css) => ("css selector", css.clone()),
            Self::XPath(xpath) => ("xpath", xpath.clone()),
            Self::LinkText(text) => ("link text", text.clone()),
        }
    }
}

/// Capabilities the UI binding needs from a browser.
pub trait BrowserDriver {
    fn navigate(&mut self, url: &str) -> Result<(), PortError>;

    /// Wait for `locator` and click it.
    fn click(&mut self, locator: &Locator, timeout: Duration) -> Result<(), PortError>;

    fn wait_for_element(&mut self, locator: &Locator, timeout: Duration) -> Result<(), PortError>;

    fn type_text(&mut self, locator: &Locator, text: &str, timeout: Duration)
    -> Result<(), PortError>;

    /// Cell texts of every body row that has `td` cells.
    fn read_table(&mut self, table: &Locator, timeout: Duration)
    -> Result<Vec<Vec<String>>, PortError>;

    /// Click `target` inside row `row` of the rows returned by [`Self::read_table`].
    fn click_in_row(
        &mut self,
        table: &Locator,
        row: usize,
        target: &Locator,
        timeout: Duration,
    ) -> Result<(), PortError>;
}

pub struct WebDriverClient {
    agent: ureq::Agent,
    session_url: String,
}

enum Method {
    Get,
    Post(Value),
}

impl WebDriverClient {
    pub fn attach(webdriver_url: &str, session_id: &str, request_timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request_timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            session_url: format!(
                "{}/session/{}",
                webdriver_url.trim_end_matches('/'),
                session_id
            ),
        }
    }

    fn command(&self, method: Method, path: &str) -> Result<Value, PortError> {
        let url = format!("{}{}", self.session_url, path);
        let result = match method {
            Method::Get => self.agent.get(&url).call(),
            Method::Post(body) => self.agent.post(&url).send_json(&body),
        };
        let response =
            result.map_err(|err| PortError::Access(format!("webdriver {path}: {err}")))?;
        let ok = response.status().is_success();
        let body = response
            .into_body()
            .read_json::<Value>()
            .map_err(|err| {
                PortError::Access(format!("webdriver {path}: invalid response: {err}"))
            })?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if ok {
            Ok(value)
        } else {
            Err(classify_failure(path, &value))
        }
    }

    fn find_from(&self, scope: Option<&str>, locator: &Locator) -> Result<String, PortError> {
        let (using, selector) = locator.strategy();
        let path = match scope {
            Some(element) => format!("/element/{element}/element"),
            None => "/element".to_string(),
        };
        let value = self.command(Method::Post(json!({"using": using, "value": selector})), &path)?;
        element_id(&value)
    }

    fn find_all_from(&self, scope: &str, locator: &Locator) -> Result<Vec<String>, PortError> {
        let (using, selector) = locator.strategy();
        let value = self.command(
            Method::Post(json!({"using": using, "value": selector})),
            &format!("/element/{scope}/elements"),
        )?;
        value
            .as_array()
            .map(|items| items.iter().map(element_id).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn text_of(&self, element: &str) -> Result<String, PortError> {
        let value = self.command(Method::Get, &format!("/element/{element}/text"))?;
        Ok(value.as_str().unwrap_or_default().trim().to_string())
    }

    fn click_element(&self, element: &str) -> Result<(), PortError> {
        self.command(Method::Post(json!({})), &format!("/element/{element}/click"))?;
        Ok(())
    }

    /// Poll `find` until it yields a value. Transient lookups retry, anything
    /// else stops the wait.
    fn wait_for<T>(
        &self,
        what: &str,
        timeout: Duration,
        mut find: impl FnMut(&Self) -> Result<T, PortError>,
    ) -> Result<T, PortError> {
        let mut found = None;
        let present = wait_until(timeout, POLL_INTERVAL, || match find(self) {
            Ok(value) => {
                found = Some(value);
                Ok(true)
            }
            Err(PortError::TransientUi(_)) => Ok(false),
            Err(err) => Err(err),
        })?;
        match found {
            Some(value) if present => Ok(value),
            _ => Err(PortError::TransientUi(format!(
                "{what} not available after {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn body_rows(&self, table: &Locator) -> Result<Vec<String>, PortError> {
        let table = self.find_from(None, table)?;
        let rows = self.find_all_from(&table, &Locator::css("tr"))?;
        let mut body_rows = Vec::with_capacity(rows.len());
        for row in rows {
            if !self.find_all_from(&row, &Locator::css("td"))?.is_empty() {
                body_rows.push(row);
            }
        }
        Ok(body_rows)
    }
}

impl BrowserDriver for WebDriverClient {
    fn navigate(&mut self, url: &str) -> Result<(), PortError> {
        debug!(url, "navigate");
        self.command(Method::Post(json!({"url": url})), "/url")?;
        Ok(())
    }

    fn click(&mut self, locator: &Locator, timeout: Duration) -> Result<(), PortError> {
        debug!(?locator, "click");
        self.wait_for(&format!("{locator:?}"), timeout, |client| {
            let element = client.find_from(None, locator)?;
            client.click_element(&element)
        })
    }

    fn wait_for_element(&mut self, locator: &Locator, timeout: Duration) -> Result<(), PortError> {
        self.wait_for(&format!("{locator:?}"), timeout, |client| {
            client.find_from(None, locator).map(|_| ())
        })
    }

    fn type_text(
        &mut self,
        locator: &Locator,
        text: &str,
        timeout: Duration,
    ) -> Result<(), PortError> {
        let element = self.wait_for(&format!("{locator:?}"), timeout, |client| {
            client.find_from(None, locator)
        })?;
        self.command(
            Method::Post(json!({"text": text})),
            &format!("/element/{element}/value"),
        )?;
        Ok(())
    }

    fn read_table(
        &mut self,
        table: &Locator,
        timeout: Duration,
    ) -> Result<Vec<Vec<String>>, PortError> {
        self.wait_for(&format!("{table:?}"), timeout, |client| {
            let mut rows = Vec::new();
            for row in client.body_rows(table)? {
                let cells = client.find_all_from(&row, &Locator::css("td"))?;
                let texts = cells
                    .iter()
                    .map(|cell| client.text_of(cell))
                    .collect::<Result<Vec<_>, _>>()?;
                rows.push(texts);
            }
            Ok(rows)
        })
    }

    fn click_in_row(
        &mut self,
        table: &Locator,
        row: usize,
        target: &Locator,
        timeout: Duration,
    ) -> Result<(), PortError> {
        debug!(row, ?target, "click in row");
        self.wait_for(&format!("{target:?} in row {row}"), timeout, |client| {
            let rows = client.body_rows(table)?;
            let row_element = rows
                .get(row)
                .ok_or_else(|| PortError::NotFound(format!("table row {row}")))?;
            let element = client.find_from(Some(row_element), target)?;
            client.click_element(&element)
        })
    }
}

fn element_id(value: &Value) -> Result<String, PortError> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PortError::Access("webdriver response without element reference".into()))
}

fn classify_failure(path: &str, value: &Value) -> PortError {
    let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or("");
    let detail = format!("webdriver {path}: {error}: {message}");
    match error {
        "no such element"
        | "stale element reference"
        | "element not interactable"
        | "element click intercepted"
        | "timeout" => PortError::TransientUi(detail),
        "invalid session id" | "no such window" => PortError::SessionExpired(detail),
        _ => PortError::Access(detail),
    }
}
