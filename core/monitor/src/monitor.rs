//! The polling loop.
//!
//! One sequential worker per repository: fetch, detect, display, persist,
//! sleep. The persisted tree for a key always reflects a poll that was fully
//! fetched, detected and displayed; failed or partial fetches are dropped.
//!
//! Phases: `Initializing -> (FirstRun | Resuming) -> Polling -> ShuttingDown
//! -> Stopped`.

use chrono::{DateTime, SecondsFormat, Utc};
use civiewer_protocol::{Event, EventType, MonitorState, RepositoryKey, RunWithJobs};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::detector::EventDetector;
use crate::display::EventSink;
use crate::github::{FetchError, RunSource};
use crate::interval::PollInterval;
use crate::shutdown::Shutdown;
use crate::store::StateStore;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("Failed to open state store: {0}")]
    Storage(String),

    #[error("Failed to reset persisted state: {0}")]
    Reset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    FirstRun,
    Resuming,
    Polling,
    ShuttingDown,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::FirstRun => "first_run",
            Phase::Resuming => "resuming",
            Phase::Polling => "polling",
            Phase::ShuttingDown => "shutting_down",
            Phase::Stopped => "stopped",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run tallies
// ═══════════════════════════════════════════════════════════════════════════════

/// Display-only counters for the whole process run. Never persisted.
#[derive(Debug)]
pub struct MonitorContext {
    started: Instant,
    counts: BTreeMap<EventType, u64>,
    polls: u64,
    failed_polls: u64,
}

impl Default for MonitorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counts: EventType::ALL.iter().map(|event_type| (*event_type, 0)).collect(),
            polls: 0,
            failed_polls: 0,
        }
    }

    pub fn record_events(&mut self, events: &[Event]) {
        for event in events {
            *self.counts.entry(event.event_type).or_insert(0) += 1;
        }
    }

    pub fn record_poll(&mut self) {
        self.polls += 1;
    }

    pub fn record_failed_poll(&mut self) {
        self.failed_polls += 1;
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            counts: self.counts.clone(),
            total_events: self.counts.values().sum(),
            polls: self.polls,
            failed_polls: self.failed_polls,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub counts: BTreeMap<EventType, u64>,
    pub total_events: u64,
    pub polls: u64,
    pub failed_polls: u64,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn count(&self, event_type: EventType) -> u64 {
        self.counts.get(&event_type).copied().unwrap_or(0)
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec!["--- Monitoring summary ---".to_string()];
        for event_type in EventType::ALL {
            lines.push(format!("{:<20} {}", event_type.as_str(), self.count(event_type)));
        }
        lines.push(format!("{:<20} {}", "Total events", self.total_events));
        lines.push(format!(
            "{:<20} {} ({} failed)",
            "Polls", self.polls, self.failed_polls
        ));
        lines.push(format!("{:<20} {}", "Elapsed", format_elapsed(self.elapsed())));
        lines
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Monitor
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Snapshot fetched, detected, merged and handed to the store.
    Completed { events: usize },
    /// Retryable fetch failure; state and watermark untouched.
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    pub detector: EventDetector,
    pub interval: PollInterval,
    /// Display the first-run baseline instead of recording it quietly.
    pub announce_existing: bool,
}

pub struct Monitor<S: RunSource, K: EventSink> {
    key: RepositoryKey,
    source: S,
    sink: K,
    store: StateStore,
    detector: EventDetector,
    interval: PollInterval,
    announce_existing: bool,
    state: MonitorState,
    context: MonitorContext,
    phase: Phase,
}

impl<S: RunSource, K: EventSink> Monitor<S, K> {
    pub fn new(
        key: RepositoryKey,
        source: S,
        sink: K,
        store: StateStore,
        options: MonitorOptions,
    ) -> Self {
        Self {
            key,
            source,
            sink,
            store,
            detector: options.detector,
            interval: options.interval,
            announce_existing: options.announce_existing,
            state: MonitorState::empty(),
            context: MonitorContext::new(),
            phase: Phase::Initializing,
        }
    }

    /// Runs until `shutdown` fires (or after one poll when `once` is set),
    /// then saves, prints the summary and closes the store. Only fatal fetch
    /// errors end the loop early; they are returned after the summary.
    pub fn run(&mut self, shutdown: &Shutdown, once: bool) -> Result<RunSummary, MonitorError> {
        let result = self.run_loop(shutdown, once);
        if let Err(err) = &result {
            error!(error = %err, repository = %self.key, "Monitoring aborted");
        }
        let summary = self.finish();
        result?;
        Ok(summary)
    }

    fn run_loop(&mut self, shutdown: &Shutdown, once: bool) -> Result<(), FetchError> {
        self.initialize();
        self.enter(Phase::Polling);

        loop {
            if shutdown.is_requested() {
                break;
            }
            let baseline = self.state.is_first_run();
            let outcome = self.poll_once()?;
            if let PollOutcome::Completed { events } = &outcome {
                debug!(events = *events, baseline, "Poll completed");
            }

            // A recorded baseline is followed straight away by a real poll.
            if baseline && outcome != PollOutcome::Failed {
                continue;
            }
            if once {
                break;
            }

            let sleep = self.interval.current();
            debug!(
                sleep_secs = sleep.as_secs(),
                empty_streak = self.interval.empty_streak(),
                "Waiting for next poll"
            );
            if shutdown.wait_timeout(sleep) {
                break;
            }
        }
        Ok(())
    }

    fn initialize(&mut self) {
        self.enter(Phase::Initializing);
        self.state = self.store.load(&self.key);
        if self.state.is_first_run() {
            self.enter(Phase::FirstRun);
            self.sink
                .notice("First run for this repository - initializing state");
        } else {
            self.enter(Phase::Resuming);
            self.sink.notice(&format!(
                "Resuming from last check timestamp: {}",
                self.state
                    .last_poll
                    .to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        info!(
            repository = %self.key,
            known_runs = self.state.known_runs.len(),
            known_jobs = self.state.job_count(),
            "Monitor state loaded"
        );
    }

    /// One poll cycle. The first cycle of a fresh repository is the baseline
    /// and stays quiet unless `announce_existing` is set.
    pub fn poll_once(&mut self) -> Result<PollOutcome, FetchError> {
        let baseline = self.state.is_first_run();
        // Captured before the fetch so updates landing mid-poll are seen again.
        let watermark = Utc::now();

        let snapshot = match fetch_snapshot(&self.source, &self.key, self.state.last_poll) {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                self.context.record_failed_poll();
                warn!(error = %err, repository = %self.key, "Poll failed; keeping previous state");
                return Ok(PollOutcome::Failed);
            }
        };
        self.context.record_poll();

        let events = self.detector.detect(&snapshot, &self.state);
        let quiet = baseline && !self.announce_existing;
        if quiet {
            info!(
                runs = snapshot.len(),
                skipped_events = events.len(),
                "Baseline recorded"
            );
        } else {
            self.display(&events);
        }

        self.state = self.state.merged(&snapshot, watermark);
        self.persist();

        if !quiet {
            self.interval.record(events.len());
        }
        if baseline {
            self.sink.notice("State initialized. Monitoring for new events...");
        }

        Ok(PollOutcome::Completed {
            events: if quiet { 0 } else { events.len() },
        })
    }

    fn display(&mut self, events: &[Event]) {
        if events.is_empty() {
            self.sink.heartbeat();
            return;
        }
        for event in events {
            self.sink.event(event);
        }
        self.context.record_events(events);
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.key, &self.state) {
            warn!(error = %err, repository = %self.key, "Failed to save monitor state");
        }
    }

    fn finish(&mut self) -> RunSummary {
        self.enter(Phase::ShuttingDown);
        self.sink.notice("Shutting down...");
        // Last committed watermark, not "now": nothing after it was fetched.
        if !self.state.is_first_run() {
            self.persist();
        }
        let summary = self.context.summary();
        self.sink.summary(&summary);
        self.store.close();
        self.enter(Phase::Stopped);
        self.sink.notice("Monitor stopped.");
        summary
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = self.phase.as_str(), to = phase.as_str(), "Monitor phase change");
        self.phase = phase;
    }
}

#[cfg(test)]
impl<S: RunSource, K: EventSink> Monitor<S, K> {
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interval(&self) -> &PollInterval {
        &self.interval
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }
}

/// Fetches every run updated since `since` and the jobs of each. Any failure
/// discards the whole batch.
pub fn fetch_snapshot<S: RunSource + ?Sized>(
    source: &S,
    key: &RepositoryKey,
    since: DateTime<Utc>,
) -> Result<Vec<RunWithJobs>, FetchError> {
    let runs = source.list_runs_updated_since(key, since)?;
    let mut snapshot = Vec::with_capacity(runs.len());
    for run in runs {
        let jobs = source.list_jobs_for_run(&run)?;
        snapshot.push(RunWithJobs { run, jobs });
    }
    Ok(snapshot)
}
