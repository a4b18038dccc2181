//! civiewer entrypoint.
//!
//! Watches the GitHub Actions runs of one repository and prints a line for
//! every workflow, job and step lifecycle transition. State lives in a small
//! SQLite database so a restart resumes where the last process stopped.

use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

use civiewer_protocol::RepositoryKey;

mod config;
mod detector;
mod display;
mod github;
mod interval;
mod logging;
mod monitor;
mod shutdown;
mod store;

use config::{default_state_dir, load_config, ConfigError, MonitorConfig};
use detector::{EventDetector, StepStartPolicy};
use display::ConsoleSink;
use github::GithubClient;
use monitor::{Monitor, MonitorError, MonitorOptions};
use shutdown::Shutdown;
use store::{StateStore, DB_FILE_NAME};

#[derive(Parser, Debug)]
#[command(name = "civiewer")]
#[command(about = "Watch GitHub Actions runs and report workflow, job and step events")]
#[command(version)]
struct Cli {
    /// Repository owner, or `owner/repo`
    #[arg(value_name = "OWNER")]
    owner: String,

    /// Repository name (omit when OWNER is `owner/repo`)
    #[arg(value_name = "REPO")]
    repo: Option<String>,

    /// GitHub token used as a bearer credential
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Config file (defaults to <state-dir>/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding state.db (defaults to ~/.civiewer)
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Base poll interval in seconds
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// GitHub API base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// When to report STEP_STARTED
    #[arg(long, value_enum)]
    step_started: Option<StepStartPolicy>,

    /// Print events for runs that already exist on the first run
    #[arg(long)]
    announce_existing: bool,

    /// Poll once (after the first-run baseline, if any) and exit
    #[arg(long)]
    once: bool,

    /// Forget persisted state for this repository before starting
    #[arg(long)]
    reset: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Print events and the summary as JSON lines
    #[arg(long)]
    json: bool,

    /// Also write diagnostics to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn repository_key(&self) -> Result<RepositoryKey, String> {
        match &self.repo {
            Some(repo) => RepositoryKey::parse(&format!("{}/{}", self.owner, repo)),
            None => RepositoryKey::parse(&self.owner),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let log_file = cli.log_file.clone().or_else(|| config.logging.file.clone());
    let _logging_guard = match logging::init(log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: {}", err);
            None
        }
    };

    match run(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

/// File config with CLI flags layered on top.
fn resolve_config(cli: &Cli) -> Result<MonitorConfig, ConfigError> {
    let config_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };
    let mut config = load_config(cli.config.as_deref(), &config_dir)?;

    if let Some(dir) = &cli.state_dir {
        config.storage.state_dir = Some(dir.clone());
    }
    if let Some(secs) = cli.interval {
        config.polling.base_interval_secs = secs;
        config.polling.max_interval_secs = config.polling.max_interval_secs.max(secs);
    }
    if let Some(url) = &cli.api_url {
        config.github.api_url = url.clone();
    }
    if let Some(policy) = cli.step_started {
        config.detection.step_started = policy;
    }
    if cli.announce_existing {
        config.detection.announce_existing = true;
    }

    config.validate()?;
    Ok(config)
}

fn run(cli: &Cli, config: MonitorConfig) -> Result<(), MonitorError> {
    let key = cli
        .repository_key()
        .map_err(|err| MonitorError::Config(ConfigError::Invalid(err)))?;
    let state_dir = config.state_dir()?;
    let mut store =
        StateStore::open(state_dir.join(DB_FILE_NAME)).map_err(MonitorError::Storage)?;
    if cli.reset {
        let removed = store.clear(&key).map_err(MonitorError::Reset)?;
        info!(repository = %key, rows = removed, "Cleared persisted state");
    }

    let token = cli
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if token.is_none() {
        warn!("No GitHub token provided; unauthenticated requests are heavily rate limited");
    }

    let client = GithubClient::new(key.clone(), token, &config.github)?;
    match client.verify_repository() {
        Ok(()) => {}
        Err(err) if err.is_fatal() => return Err(err.into()),
        Err(err) => warn!(error = %err, "Could not verify repository; continuing"),
    }

    let shutdown = Shutdown::new();
    if let Err(err) = shutdown.install_signal_handler() {
        warn!(error = %err, "Interrupts will not trigger a clean shutdown");
    }

    let color = !cli.no_color && std::io::stdout().is_terminal();
    let sink = ConsoleSink::stdout(color, cli.json);
    let options = MonitorOptions {
        detector: EventDetector::new(config.detection.step_started),
        interval: config.polling.interval(),
        announce_existing: config.detection.announce_existing,
    };

    info!(
        repository = %key,
        db = %store.path().display(),
        api_url = %config.github.api_url,
        step_started = ?config.detection.step_started,
        base_interval_secs = config.polling.base_interval_secs,
        "Monitoring started"
    );

    let mut monitor = Monitor::new(key, client, sink, store, options);
    monitor.run(&shutdown, cli.once)?;
    Ok(())
}
