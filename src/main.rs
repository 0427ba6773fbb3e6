//! `playlist-dl` command line entry point

use clap::Parser;
use playlist_dl::{Config, RunCoordinator, cancel_on_signal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download every video of a playlist, a few at a time", long_about = None)]
struct Args {
    /// Playlist to download
    #[arg(short, long)]
    playlist_id: String,

    /// Listing API key
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of items processed at once
    #[arg(short, long)]
    workers: Option<usize>,

    /// Hard limit for one item, in seconds
    #[arg(long, value_name = "SECS")]
    item_timeout: Option<u64>,

    /// How long to wait for a download to finish, in seconds
    #[arg(long, value_name = "SECS")]
    download_timeout: Option<u64>,

    /// Download directory polling interval, in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Directory receiving the downloaded files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Path to the geckodriver binary
    #[arg(long, value_name = "PATH")]
    webdriver: Option<PathBuf>,

    /// Use an already running WebDriver server instead of launching one
    #[arg(long, value_name = "URL")]
    webdriver_url: Option<String>,

    /// Show the browser window
    #[arg(long)]
    no_headless: bool,
}

impl Args {
    fn into_config(self) -> playlist_dl::Result<(String, Config)> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;

        if let Some(key) = self.api_key {
            config.source.api_key = Some(key);
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(secs) = self.item_timeout {
            config.pool.item_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.download_timeout {
            config.detector.download_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            config.detector.poll_interval = Duration::from_millis(ms);
        }
        if let Some(dir) = self.output_dir {
            config.pool.output_dir = dir;
        }
        if let Some(path) = self.webdriver {
            config.processor.webdriver_path = Some(path);
        }
        if let Some(url) = self.webdriver_url {
            config.processor.webdriver_url = Some(url);
        }
        if self.no_headless {
            config.processor.headless = false;
        }

        Ok((self.playlist_id, config))
    }
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,playlist_dl=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> playlist_dl::Result<()> {
    let (playlist_id, config) = args.into_config()?;
    let coordinator = RunCoordinator::from_config(config)?;

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());
    let result = coordinator.run(&playlist_id, &cancel).await;
    signals.abort();

    // The coordinator already logged the summary line
    result.map(|_| ())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Run aborted");
            eprintln!("playlist-dl error: {e}");
            ExitCode::FAILURE
        }
    }
}
