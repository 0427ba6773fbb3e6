//! Browser-driven processor speaking the W3C WebDriver protocol
//!
//! One item gets one browser: a `geckodriver` process is started on a free
//! local port (or an external WebDriver server is used), a Firefox session is
//! created with downloads routed into the item's directory, and the configured
//! [`InteractionStep`]s are replayed against the converter page.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::wire::{WebDriverClient, WebDriverError};
use super::{AgentLease, ItemProcessor};
use crate::config::{InteractionStep, ProcessorConfig, StepAction, StepCondition};
use crate::error::{Error, ProcessorError, Result};
use crate::types::WorkItem;

/// WebDriver key code for Enter
const ENTER_KEY: char = '\u{E007}';

/// Upper bound for deleting a session during teardown
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between readiness checks while the driver starts
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the WebDriver server comes from
#[derive(Clone, Debug)]
enum DriverEndpoint {
    /// Launch this binary for every item
    Launch(PathBuf),
    /// Connect to a server that is already running
    Remote(String),
}

/// Processor that drives Firefox through WebDriver
///
/// # Examples
///
/// ```no_run
/// use playlist_dl::config::ProcessorConfig;
/// use playlist_dl::processor::WebDriverProcessor;
///
/// # fn main() -> playlist_dl::Result<()> {
/// // geckodriver from PATH, default converter steps
/// let processor = WebDriverProcessor::new(ProcessorConfig::default())?;
/// # Ok(())
/// # }
/// ```
pub struct WebDriverProcessor {
    config: ProcessorConfig,
    endpoint: DriverEndpoint,
}

impl WebDriverProcessor {
    /// Create a processor, resolving the WebDriver server from configuration
    ///
    /// Precedence: `webdriver_url`, then `webdriver_path`, then `geckodriver`
    /// found on `PATH` (when `search_path` is enabled).
    ///
    /// # Errors
    /// Returns a configuration error if no WebDriver server can be resolved.
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        let endpoint = if let Some(url) = &config.webdriver_url {
            DriverEndpoint::Remote(url.clone())
        } else if let Some(path) = &config.webdriver_path {
            DriverEndpoint::Launch(path.clone())
        } else if config.search_path {
            let path = which::which("geckodriver").map_err(|_| {
                Error::config(
                    "processor.webdriver_path",
                    "geckodriver not found in PATH; install it or set an explicit path",
                )
            })?;
            DriverEndpoint::Launch(path)
        } else {
            return Err(Error::config(
                "processor.webdriver_path",
                "no WebDriver binary or URL configured and PATH search is disabled",
            ));
        };

        tracing::debug!(endpoint = ?endpoint, "resolved WebDriver server");
        Ok(Self { config, endpoint })
    }

    /// Firefox capabilities routing downloads into `download_dir` without dialogs
    fn capabilities(&self, download_dir: &Path) -> Value {
        let args: Vec<&str> = if self.config.headless {
            vec!["-headless"]
        } else {
            Vec::new()
        };

        json!({
            "browserName": "firefox",
            "moz:firefoxOptions": {
                "args": args,
                "prefs": {
                    "browser.download.folderList": 2,
                    "browser.download.dir": download_dir.display().to_string(),
                    "browser.download.useDownloadDir": true,
                    "browser.download.manager.showWhenStarting": false,
                    "browser.helperApps.neverAsk.saveToDisk":
                        self.config.save_to_disk_mime_types.join(","),
                }
            }
        })
    }

    /// Start (or connect to) a driver and open a browser session
    async fn launch(
        &self,
        download_dir: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<BrowserAgent, ProcessorError> {
        let (base_url, child) = match &self.endpoint {
            DriverEndpoint::Remote(url) => (url.clone(), None),
            DriverEndpoint::Launch(binary) => {
                let port = free_port()?;
                let child = Command::new(binary)
                    .arg("--port")
                    .arg(port.to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        ProcessorError::Launch(format!("failed to start {}: {}", binary.display(), e))
                    })?;
                (format!("http://127.0.0.1:{port}"), Some(child))
            }
        };

        let client = WebDriverClient::new(base_url, self.config.launch_timeout)
            .map_err(|e| ProcessorError::Launch(e.to_string()))?;
        // From here on every exit path releases the agent through its Drop
        let mut agent = BrowserAgent {
            client,
            session_id: None,
            child,
        };

        agent.wait_ready(self.config.launch_timeout, cancel).await?;

        let session_id = agent
            .client
            .new_session(self.capabilities(download_dir))
            .await
            .map_err(|e| ProcessorError::Launch(format!("could not create browser session: {e}")))?;
        tracing::debug!(session_id = %session_id, dir = %download_dir.display(), "browser session started");
        agent.session_id = Some(session_id);

        Ok(agent)
    }

    /// Open the converter page and replay every step
    async fn drive(
        &self,
        agent: &BrowserAgent,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProcessorError> {
        let session_id = agent
            .session_id
            .as_deref()
            .ok_or_else(|| ProcessorError::Other("browser session missing".into()))?;

        agent
            .client
            .navigate(session_id, &self.config.base_url)
            .await
            .map_err(|e| automation("open converter page", e))?;

        for step in &self.config.steps {
            if cancel.is_cancelled() {
                return Err(ProcessorError::Cancelled);
            }
            self.run_step(&agent.client, session_id, step, item, cancel)
                .await?;
            tracing::debug!(item = %item, step = %step.name, "interaction step done");
        }

        Ok(())
    }

    /// Wait for the step's element to reach its condition, then act on it
    async fn run_step(
        &self,
        client: &WebDriverClient,
        session_id: &str,
        step: &InteractionStep,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProcessorError> {
        let deadline = Instant::now() + step.wait;

        loop {
            match try_step(client, session_id, step, item).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_not_ready() => {
                    tracing::trace!(step = %step.name, error = %e, "element not ready yet");
                }
                Err(e) => return Err(automation(&step.name, e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProcessorError::StepTimeout {
                    step: step.name.clone(),
                    timeout: step.wait,
                });
            }

            let next = (now + self.config.step_poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }
}

/// One attempt at a step; `Ok(false)` while the condition is not met
async fn try_step(
    client: &WebDriverClient,
    session_id: &str,
    step: &InteractionStep,
    item: &WorkItem,
) -> std::result::Result<bool, WebDriverError> {
    let Some(element) = client.find_element(session_id, &step.locator).await? else {
        return Ok(false);
    };

    if step.condition == StepCondition::Clickable
        && !(client.is_displayed(session_id, &element).await?
            && client.is_enabled(session_id, &element).await?)
    {
        return Ok(false);
    }

    match &step.action {
        StepAction::Type { text, submit } => {
            let mut keys = text.replace("{item}", item.as_str());
            if *submit {
                keys.push(ENTER_KEY);
            }
            client.send_keys(session_id, &element, &keys).await?;
        }
        StepAction::Click => client.click(session_id, &element).await?,
    }

    Ok(true)
}

fn automation(step: &str, error: WebDriverError) -> ProcessorError {
    ProcessorError::Automation {
        step: step.to_string(),
        message: error.to_string(),
    }
}

/// Reserve a free local port for the driver
fn free_port() -> std::result::Result<u16, ProcessorError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl ItemProcessor for WebDriverProcessor {
    async fn process(
        &self,
        item: &WorkItem,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn AgentLease>, ProcessorError> {
        // Firefox ignores relative download directories
        let download_dir = std::path::absolute(output_dir)?;

        let mut agent = self.launch(&download_dir, cancel).await?;

        match self.drive(&agent, item, cancel).await {
            Ok(()) => Ok(Box::new(agent)),
            Err(e) => {
                agent.shutdown().await;
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "webdriver"
    }
}

/// A running browser session and, when launched locally, its driver process
struct BrowserAgent {
    client: WebDriverClient,
    session_id: Option<String>,
    child: Option<Child>,
}

impl BrowserAgent {
    /// Poll the driver's status endpoint until it accepts sessions
    async fn wait_ready(
        &mut self,
        launch_timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProcessorError> {
        let deadline = Instant::now() + launch_timeout;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(ProcessorError::Launch(format!(
                        "WebDriver server exited during startup ({status})"
                    )));
                }
            }

            if let Ok(true) = self.client.is_ready().await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ProcessorError::Launch(format!(
                    "WebDriver server at {} not ready within {}s",
                    self.client.base_url(),
                    launch_timeout.as_secs_f64()
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                _ = tokio::time::sleep(LAUNCH_POLL_INTERVAL) => {}
            }
        }
    }

    /// Close the browser and stop the driver
    async fn shutdown(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            match tokio::time::timeout(
                SESSION_CLOSE_TIMEOUT,
                self.client.delete_session(&session_id),
            )
            .await
            {
                Ok(Ok(())) => tracing::debug!(session_id = %session_id, "browser session closed"),
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %session_id, error = %e, "failed to close browser session")
                }
                Err(_) => tracing::warn!(session_id = %session_id, "closing browser session timed out"),
            }
        }

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "WebDriver server already gone");
            }
        }
    }
}

#[async_trait]
impl AgentLease for BrowserAgent {
    async fn release(self: Box<Self>) {
        let mut agent = self;
        agent.shutdown().await;
    }
}

impl Drop for BrowserAgent {
    fn drop(&mut self) {
        if self.session_id.is_none() && self.child.is_none() {
            return;
        }

        // Aborted without an orderly shutdown: finish it in the background
        let session_id = self.session_id.take();
        let child = self.child.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    let mut orphan = BrowserAgent {
                        client,
                        session_id,
                        child,
                    };
                    orphan.shutdown().await;
                });
            }
            // kill_on_drop stops the driver
            Err(_) => drop(child),
        }
    }
}
