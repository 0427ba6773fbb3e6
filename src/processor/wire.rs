//! Minimal W3C WebDriver client
//!
//! Only the handful of commands the interaction steps need are implemented:
//! status, session creation and deletion, navigation, element lookup, element
//! state, click and send keys.

use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

use crate::config::Locator;

/// Key under which W3C drivers return element references
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a5eb2a3e456";

/// WebDriver protocol errors
#[derive(Debug, Error)]
pub enum WebDriverError {
    /// The driver answered with a W3C error object
    #[error("{error}: {message}")]
    Command {
        /// W3C error code, e.g. "no such element"
        error: String,
        /// Driver-supplied message
        message: String,
    },

    /// The request did not reach the driver or timed out
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The driver's answer could not be interpreted
    #[error("unexpected response: {0}")]
    Response(String),
}

impl WebDriverError {
    /// Whether the error only means the page has not reached the expected state yet
    pub fn is_not_ready(&self) -> bool {
        match self {
            WebDriverError::Command { error, .. } => matches!(
                error.as_str(),
                "no such element"
                    | "stale element reference"
                    | "element not interactable"
                    | "element click intercepted"
            ),
            _ => false,
        }
    }
}

/// HTTP client bound to one WebDriver server
#[derive(Clone, Debug)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
}

impl WebDriverClient {
    /// Create a client for the server at `base_url` (e.g. `http://127.0.0.1:4444`)
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, WebDriverError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Server base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, WebDriverError> {
        let mut request = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| WebDriverError::Response(format!("{path}: {e}")))?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(value);
        }

        Err(WebDriverError::Command {
            error: value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Whether the server accepts new sessions
    pub async fn is_ready(&self) -> Result<bool, WebDriverError> {
        let value = self.execute(Method::GET, "/status", None).await?;
        Ok(value.get("ready").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Create a session; `capabilities` go into `alwaysMatch`
    pub async fn new_session(&self, capabilities: Value) -> Result<String, WebDriverError> {
        let value = self
            .execute(
                Method::POST,
                "/session",
                Some(json!({ "capabilities": { "alwaysMatch": capabilities } })),
            )
            .await?;

        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WebDriverError::Response("session response without sessionId".into()))
    }

    /// Delete a session, closing its browser
    pub async fn delete_session(&self, session_id: &str) -> Result<(), WebDriverError> {
        self.execute(Method::DELETE, &format!("/session/{session_id}"), None)
            .await
            .map(|_| ())
    }

    /// Navigate the session's top-level browsing context
    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), WebDriverError> {
        self.execute(
            Method::POST,
            &format!("/session/{session_id}/url"),
            Some(json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    /// Look up one element; `Ok(None)` if it is not in the document
    pub async fn find_element(
        &self,
        session_id: &str,
        locator: &Locator,
    ) -> Result<Option<String>, WebDriverError> {
        let (using, value) = match locator {
            // W3C has no id strategy
            Locator::Id(id) => ("css selector", format!("[id=\"{}\"]", id.replace('"', "\\\""))),
            Locator::Css(css) => ("css selector", css.clone()),
            Locator::Xpath(xpath) => ("xpath", xpath.clone()),
        };

        let result = self
            .execute(
                Method::POST,
                &format!("/session/{session_id}/element"),
                Some(json!({ "using": using, "value": value })),
            )
            .await;

        match result {
            Ok(value) => value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| WebDriverError::Response("element response without reference".into())),
            Err(WebDriverError::Command { error, .. }) if error == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn element_flag(
        &self,
        session_id: &str,
        element_id: &str,
        flag: &str,
    ) -> Result<bool, WebDriverError> {
        let value = self
            .execute(
                Method::GET,
                &format!("/session/{session_id}/element/{element_id}/{flag}"),
                None,
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Whether the element is rendered
    pub async fn is_displayed(&self, session_id: &str, element_id: &str) -> Result<bool, WebDriverError> {
        self.element_flag(session_id, element_id, "displayed").await
    }

    /// Whether the element accepts input
    pub async fn is_enabled(&self, session_id: &str, element_id: &str) -> Result<bool, WebDriverError> {
        self.element_flag(session_id, element_id, "enabled").await
    }

    /// Click the element
    pub async fn click(&self, session_id: &str, element_id: &str) -> Result<(), WebDriverError> {
        self.execute(
            Method::POST,
            &format!("/session/{session_id}/element/{element_id}/click"),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    /// Type `text` into the element
    pub async fn send_keys(
        &self,
        session_id: &str,
        element_id: &str,
        text: &str,
    ) -> Result<(), WebDriverError> {
        self.execute(
            Method::POST,
            &format!("/session/{session_id}/element/{element_id}/value"),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }
}
