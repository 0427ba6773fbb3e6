//! Configuration types for playlist-dl
//!
//! A [`Config`] is built once per run, validated, and then shared read-only by
//! every component. Values come from three layers, later layers winning:
//! 1. the defaults below (or a JSON config file, see [`Config::from_file`])
//! 2. environment variables ([`Config::apply_env`])
//! 3. command-line flags (applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable holding the listing-service credential
pub const ENV_API_KEY: &str = "API_KEY";
/// Environment variable overriding [`PoolConfig::workers`]
pub const ENV_WORKERS: &str = "PLAYLIST_DL_WORKERS";
/// Environment variable overriding [`PoolConfig::item_timeout`] (seconds)
pub const ENV_ITEM_TIMEOUT_SECS: &str = "PLAYLIST_DL_ITEM_TIMEOUT_SECS";
/// Environment variable overriding [`DetectorConfig::download_timeout`] (seconds)
pub const ENV_DOWNLOAD_TIMEOUT_SECS: &str = "PLAYLIST_DL_DOWNLOAD_TIMEOUT_SECS";
/// Environment variable overriding [`DetectorConfig::poll_interval`] (milliseconds)
pub const ENV_POLL_INTERVAL_MS: &str = "PLAYLIST_DL_POLL_INTERVAL_MS";
/// Environment variable overriding [`PoolConfig::output_dir`]
pub const ENV_OUTPUT_DIR: &str = "PLAYLIST_DL_OUTPUT_DIR";

/// Largest accepted [`RetryConfig::backoff_multiplier`]
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Main configuration for a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listing-service settings (credential, endpoint, paging)
    #[serde(default)]
    pub source: SourceConfig,

    /// Worker pool settings (concurrency, timeouts, output directory)
    #[serde(default)]
    pub pool: PoolConfig,

    /// Completion detector settings (polling, markers)
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Browser automation settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Retry policy for listing-service page requests
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Listing-service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// API key used to list the collection (usually supplied via `API_KEY`)
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Base URL of the listing API (default: YouTube Data API v3)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Base URL used to turn an item id into a locator
    #[serde(default = "default_watch_url_base")]
    pub watch_url_base: String,

    /// Items requested per page (the API caps this at 50)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Timeout for a single page request (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: default_api_base_url(),
            watch_url_base: default_watch_url_base(),
            page_size: default_page_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of items processed at the same time (default: 5)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Hard limit for one item, from dispatch to outcome (default: 360 seconds)
    ///
    /// Covers the interaction steps and the wait for the artifact. An item that
    /// exceeds it is terminated and recorded as timed out.
    #[serde(default = "default_item_timeout", with = "duration_serde")]
    pub item_timeout: Duration,

    /// How long before `item_timeout` an item is asked to stop, so it can release
    /// its external agent before its outcome is due (default: 10 seconds)
    ///
    /// Capped at half of `item_timeout`. Whatever is still running at
    /// `item_timeout` is aborted.
    #[serde(default = "default_teardown_grace", with = "duration_serde")]
    pub teardown_grace: Duration,

    /// Shared output directory; created if absent (default: "./downloads")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// What to do when a finished artifact collides with an existing file
    #[serde(default)]
    pub file_collision: FileCollisionAction,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            item_timeout: default_item_timeout(),
            teardown_grace: default_teardown_grace(),
            output_dir: default_output_dir(),
            file_collision: FileCollisionAction::default(),
        }
    }
}

/// Completion detector configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Interval between directory scans in milliseconds (default: 2000)
    #[serde(default = "default_poll_interval", with = "duration_millis_serde")]
    pub poll_interval: Duration,

    /// How long to wait for transient markers to disappear (default: 300 seconds)
    #[serde(default = "default_download_timeout", with = "duration_serde")]
    pub download_timeout: Duration,

    /// File name suffixes marking an artifact that is still being written
    #[serde(default = "default_marker_suffixes")]
    pub marker_suffixes: Vec<String>,

    /// Only declare completion once at least one final file exists (default: true)
    #[serde(default = "default_true")]
    pub require_artifact: bool,

    /// Wake up early on filesystem notifications between scans (default: true)
    #[serde(default = "default_true")]
    pub watch_events: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            download_timeout: default_download_timeout(),
            marker_suffixes: default_marker_suffixes(),
            require_artifact: true,
            watch_events: true,
        }
    }
}

/// Browser automation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Path to the WebDriver server binary (auto-detected if None)
    #[serde(default)]
    pub webdriver_path: Option<PathBuf>,

    /// Whether to search PATH for the WebDriver binary if no explicit path is set
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Use an already running WebDriver server instead of launching one per item
    #[serde(default)]
    pub webdriver_url: Option<String>,

    /// Page the interaction steps are driven against
    #[serde(default = "default_converter_url")]
    pub base_url: String,

    /// Run the browser without a window (default: true)
    #[serde(default = "default_true")]
    pub headless: bool,

    /// MIME types the browser saves without asking
    #[serde(default = "default_save_to_disk_mime_types")]
    pub save_to_disk_mime_types: Vec<String>,

    /// How long the WebDriver server and session may take to come up (default: 30 seconds)
    #[serde(default = "default_launch_timeout", with = "duration_serde")]
    pub launch_timeout: Duration,

    /// Interval between checks while waiting for a step's condition, in milliseconds
    #[serde(default = "default_step_poll_interval", with = "duration_millis_serde")]
    pub step_poll_interval: Duration,

    /// The interaction performed for every item
    #[serde(default = "default_steps")]
    pub steps: Vec<InteractionStep>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            webdriver_path: None,
            search_path: true,
            webdriver_url: None,
            base_url: default_converter_url(),
            headless: true,
            save_to_disk_mime_types: default_save_to_disk_mime_types(),
            launch_timeout: default_launch_timeout(),
            step_poll_interval: default_step_poll_interval(),
            steps: default_steps(),
        }
    }
}

/// One step of the per-item browser interaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionStep {
    /// Name used in logs and failure reasons
    pub name: String,

    /// Element the step acts on
    pub locator: Locator,

    /// State the element must reach before the action is performed
    #[serde(default)]
    pub condition: StepCondition,

    /// What to do with the element
    pub action: StepAction,

    /// How long to wait for the condition (default: 15 seconds)
    #[serde(default = "default_step_wait", with = "duration_serde")]
    pub wait: Duration,
}

/// Element locator strategy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "using", content = "value", rename_all = "snake_case")]
pub enum Locator {
    /// Element id attribute
    Id(String),
    /// CSS selector
    Css(String),
    /// XPath expression
    Xpath(String),
}

/// Condition an element must satisfy before a step acts on it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// The element exists in the document
    #[default]
    Present,
    /// The element is displayed and enabled
    Clickable,
}

/// Action performed on an element
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Type text into the element; `{item}` is replaced by the item locator
    Type {
        /// Text template
        text: String,
        /// Press Enter after typing
        #[serde(default)]
        submit: bool,
    },
    /// Click the element
    Click,
}

/// Retry configuration for transient listing-service failures
///
/// Items themselves are never retried.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff, between 1 and 10 (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// File collision handling strategy when merging artifacts into the output directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to filename (default)
    #[default]
    Rename,
    /// Overwrite existing file
    Overwrite,
    /// Skip the file, keep existing
    Skip,
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config = serde_json::from_str(&data)?;
        tracing::debug!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Empty values are ignored. Unparsable values are reported as configuration errors.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.source.api_key = Some(key);
        }
        if let Some(workers) = parse_override::<usize>(ENV_WORKERS, get(ENV_WORKERS))? {
            self.pool.workers = workers;
        }
        if let Some(secs) = parse_override::<u64>(ENV_ITEM_TIMEOUT_SECS, get(ENV_ITEM_TIMEOUT_SECS))? {
            self.pool.item_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse_override::<u64>(ENV_DOWNLOAD_TIMEOUT_SECS, get(ENV_DOWNLOAD_TIMEOUT_SECS))?
        {
            self.detector.download_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_override::<u64>(ENV_POLL_INTERVAL_MS, get(ENV_POLL_INTERVAL_MS))? {
            self.detector.poll_interval = Duration::from_millis(ms);
        }
        if let Some(dir) = get(ENV_OUTPUT_DIR) {
            self.pool.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check the settings the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(Error::config("pool.workers", "must be at least 1"));
        }
        if self.pool.item_timeout.is_zero() {
            return Err(Error::config("pool.item_timeout", "must be greater than zero"));
        }
        if self.detector.poll_interval.is_zero() {
            return Err(Error::config("detector.poll_interval", "must be greater than zero"));
        }
        if self.detector.download_timeout.is_zero() {
            return Err(Error::config(
                "detector.download_timeout",
                "must be greater than zero",
            ));
        }
        if self.detector.marker_suffixes.iter().any(|s| s.is_empty()) {
            return Err(Error::config(
                "detector.marker_suffixes",
                "marker suffixes must not be empty",
            ));
        }
        if self.source.page_size == 0 || self.source.page_size > 50 {
            return Err(Error::config("source.page_size", "must be between 1 and 50"));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&multiplier) {
            return Err(Error::config(
                "retry.backoff_multiplier",
                format!("must be between 1 and {MAX_BACKOFF_MULTIPLIER}"),
            ));
        }
        Ok(())
    }
}

fn parse_override<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(key, format!("invalid value '{raw}'"))),
    }
}

/// The reference interaction against the converter page
fn default_steps() -> Vec<InteractionStep> {
    vec![
        InteractionStep {
            name: "submit locator".to_string(),
            locator: Locator::Id("v".to_string()),
            condition: StepCondition::Present,
            action: StepAction::Type {
                text: "{item}".to_string(),
                submit: true,
            },
            wait: Duration::from_secs(15),
        },
        InteractionStep {
            name: "start conversion".to_string(),
            locator: Locator::Xpath("//button[contains(text(), 'Download')]".to_string()),
            condition: StepCondition::Clickable,
            action: StepAction::Click,
            wait: Duration::from_secs(20),
        },
        InteractionStep {
            name: "start download".to_string(),
            locator: Locator::Xpath("//button[contains(text(), 'Next')]".to_string()),
            condition: StepCondition::Clickable,
            action: StepAction::Click,
            wait: Duration::from_secs(15),
        },
    ]
}

fn default_api_base_url() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

fn default_watch_url_base() -> String {
    "https://www.youtube.com/watch".to_string()
}

fn default_page_size() -> u32 {
    50
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_workers() -> usize {
    5
}

fn default_item_timeout() -> Duration {
    Duration::from_secs(360)
}

fn default_teardown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_marker_suffixes() -> Vec<String> {
    vec![".part".to_string()]
}

fn default_converter_url() -> String {
    "https://y2mate.nu/en-s60K/".to_string()
}

fn default_save_to_disk_mime_types() -> Vec<String> {
    vec!["video/mp4".to_string(), "application/octet-stream".to_string()]
}

fn default_launch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_step_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_step_wait() -> Duration {
    Duration::from_secs(15)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper (poll intervals)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
