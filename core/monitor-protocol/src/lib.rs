//! Data model shared by the civiewer monitor and its tests.
//!
//! Two families of records live here:
//!
//! - *Snapshots* are what a single poll observed on the CI provider
//!   (`RunSnapshot`, `JobSnapshot`, `StepSnapshot`).
//! - *State* is what has already been observed and persisted
//!   (`MonitorState` -> `RunState` -> `JobState` -> `StepState`).
//!
//! The tree is plain values keyed by id (runs, jobs) or step key (see
//! [`step_keys`]); there are no back references, so merging a poll into the
//! tree is a map union.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

mod event;

pub use event::{Event, EventType};

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_QUEUED: &str = "queued";
pub const SHORT_SHA_LEN: usize = 7;

const FAILURE_CONCLUSIONS: [&str; 2] = ["failure", "failed"];

pub fn is_completed(status: &str) -> bool {
    status == STATUS_COMPLETED
}

/// Statuses that count as "running or about to run".
pub fn is_active(status: &str) -> bool {
    status == STATUS_IN_PROGRESS || status == STATUS_QUEUED
}

pub fn is_failure(conclusion: Option<&str>) -> bool {
    conclusion
        .map(|value| FAILURE_CONCLUSIONS.contains(&value))
        .unwrap_or(false)
}

/// A conclusion only means something once the entity has completed.
pub fn settled_conclusion(status: &str, conclusion: Option<&str>) -> Option<String> {
    if is_completed(status) {
        conclusion.map(str::to_string)
    } else {
        None
    }
}

/// Keys a job's steps in order. A name is its own key the first time it
/// appears in a job; the nth repeat (n >= 2) is keyed `name#n`.
pub fn step_keys(steps: &[StepSnapshot]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    steps
        .iter()
        .map(|step| {
            let occurrence = seen.entry(step.name.as_str()).or_insert(0);
            *occurrence += 1;
            if *occurrence == 1 {
                step.name.clone()
            } else {
                format!("{}#{}", step.name, occurrence)
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Repository key
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryKey {
    pub owner: String,
    pub repo: String,
}

impl RepositoryKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Parses `owner/repo`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut parts = value.trim().splitn(2, '/');
        let owner = parts.next().map(str::trim).unwrap_or_default();
        let repo = parts.next().map(str::trim).unwrap_or_default();
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(format!(
                "Invalid repository '{}': expected <owner>/<repo>",
                value
            ));
        }
        Ok(Self::new(owner, repo))
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshots (one poll's view of the provider)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: u64,
    pub name: String,
    pub head_branch: String,
    pub head_sha: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub jobs_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub number: u32,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

/// A run together with every job fetched for it during the same poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWithJobs {
    pub run: RunSnapshot,
    pub jobs: Vec<JobSnapshot>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persisted state
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    /// Key within the job, see [`step_keys`].
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

impl StepState {
    pub fn from_snapshot(key: String, step: &StepSnapshot) -> Self {
        Self {
            name: key,
            status: step.status.clone(),
            conclusion: settled_conclusion(&step.status, step.conclusion.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: u64,
    pub status: String,
    pub conclusion: Option<String>,
    pub known_steps: BTreeMap<String, StepState>,
}

impl JobState {
    pub fn from_snapshot(job: &JobSnapshot) -> Self {
        let known_steps = step_keys(&job.steps)
            .into_iter()
            .zip(&job.steps)
            .map(|(key, step)| (key.clone(), StepState::from_snapshot(key, step)))
            .collect();
        Self {
            job_id: job.id,
            status: job.status.clone(),
            conclusion: settled_conclusion(&job.status, job.conclusion.as_deref()),
            known_steps,
        }
    }

    fn retain_unseen(&mut self, previous: &JobState) {
        for (name, step) in &previous.known_steps {
            self.known_steps
                .entry(name.clone())
                .or_insert_with(|| step.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: u64,
    pub status: String,
    pub conclusion: Option<String>,
    pub known_jobs: BTreeMap<u64, JobState>,
}

impl RunState {
    pub fn from_snapshot(entry: &RunWithJobs) -> Self {
        let known_jobs = entry
            .jobs
            .iter()
            .map(|job| (job.id, JobState::from_snapshot(job)))
            .collect();
        Self {
            run_id: entry.run.id,
            status: entry.run.status.clone(),
            conclusion: settled_conclusion(&entry.run.status, entry.run.conclusion.as_deref()),
            known_jobs,
        }
    }

    /// Jobs (and steps) missing from the latest poll stay known.
    fn retain_unseen(&mut self, previous: &RunState) {
        for (job_id, previous_job) in &previous.known_jobs {
            match self.known_jobs.get_mut(job_id) {
                Some(job) => job.retain_unseen(previous_job),
                None => {
                    self.known_jobs.insert(*job_id, previous_job.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    /// Watermark for the next fetch. `UNIX_EPOCH` means nothing was ever saved.
    pub last_poll: DateTime<Utc>,
    pub known_runs: BTreeMap<u64, RunState>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::empty()
    }
}

impl MonitorState {
    pub fn empty() -> Self {
        Self {
            last_poll: DateTime::<Utc>::UNIX_EPOCH,
            known_runs: BTreeMap::new(),
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.last_poll == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Returns the tree after a poll. Fetched entities overwrite their previous
    /// status and conclusion; anything the poll did not return is kept as is.
    pub fn merged(&self, snapshot: &[RunWithJobs], watermark: DateTime<Utc>) -> Self {
        let mut known_runs = self.known_runs.clone();
        for entry in snapshot {
            let mut fresh = RunState::from_snapshot(entry);
            if let Some(previous) = self.known_runs.get(&entry.run.id) {
                fresh.retain_unseen(previous);
            }
            known_runs.insert(entry.run.id, fresh);
        }
        Self {
            last_poll: watermark,
            known_runs,
        }
    }

    pub fn job_count(&self) -> usize {
        self.known_runs
            .values()
            .map(|run| run.known_jobs.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run(id: u64, status: &str, conclusion: Option<&str>) -> RunSnapshot {
        let at = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        RunSnapshot {
            id,
            name: "CI".to_string(),
            head_branch: "main".to_string(),
            head_sha: "abc1234def".to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            created_at: at,
            updated_at: at,
            jobs_url: None,
        }
    }

    fn job(id: u64, status: &str, steps: Vec<StepSnapshot>) -> JobSnapshot {
        JobSnapshot {
            id,
            name: format!("job-{}", id),
            status: status.to_string(),
            conclusion: None,
            steps,
        }
    }

    fn step(number: u32, name: &str, status: &str) -> StepSnapshot {
        StepSnapshot {
            number,
            name: name.to_string(),
            status: status.to_string(),
            conclusion: None,
        }
    }

    #[test]
    fn parses_repository_key() {
        let key = RepositoryKey::parse("octo/widgets").expect("parse");
        assert_eq!(key.owner, "octo");
        assert_eq!(key.repo, "widgets");
        assert_eq!(key.to_string(), "octo/widgets");
    }

    #[test]
    fn rejects_malformed_repository_key() {
        assert!(RepositoryKey::parse("octo").is_err());
        assert!(RepositoryKey::parse("/widgets").is_err());
        assert!(RepositoryKey::parse("octo/").is_err());
        assert!(RepositoryKey::parse("a/b/c").is_err());
    }

    #[test]
    fn failure_conclusions() {
        assert!(is_failure(Some("failure")));
        assert!(is_failure(Some("failed")));
        assert!(!is_failure(Some("success")));
        assert!(!is_failure(Some("cancelled")));
        assert!(!is_failure(None));
    }

    #[test]
    fn empty_state_uses_epoch_sentinel() {
        let state = MonitorState::empty();
        assert!(state.is_first_run());
        assert!(state.known_runs.is_empty());
    }

    #[test]
    fn run_state_drops_conclusion_until_completed() {
        let entry = RunWithJobs {
            run: run(1, "in_progress", Some("failure")),
            jobs: vec![],
        };
        assert_eq!(RunState::from_snapshot(&entry).conclusion, None);

        let entry = RunWithJobs {
            run: run(1, "completed", Some("failure")),
            jobs: vec![],
        };
        assert_eq!(
            RunState::from_snapshot(&entry).conclusion.as_deref(),
            Some("failure")
        );
    }

    #[test]
    fn merge_overwrites_fetched_runs_and_keeps_the_rest() {
        let first = vec![
            RunWithJobs {
                run: run(1, "in_progress", None),
                jobs: vec![job(10, "in_progress", vec![step(1, "Build", "in_progress")])],
            },
            RunWithJobs {
                run: run(2, "queued", None),
                jobs: vec![],
            },
        ];
        let at = Utc.with_ymd_and_hms(2026, 1, 30, 12, 5, 0).unwrap();
        let state = MonitorState::empty().merged(&first, at);
        assert_eq!(state.known_runs.len(), 2);
        assert_eq!(state.job_count(), 1);
        assert!(!state.is_first_run());

        let second = vec![RunWithJobs {
            run: run(1, "completed", Some("success")),
            jobs: vec![job(11, "queued", vec![])],
        }];
        let later = at + chrono::Duration::seconds(30);
        let merged = state.merged(&second, later);

        assert_eq!(merged.last_poll, later);
        assert_eq!(merged.known_runs.len(), 2);
        let run_one = &merged.known_runs[&1];
        assert_eq!(run_one.status, "completed");
        assert_eq!(run_one.conclusion.as_deref(), Some("success"));
        assert!(run_one.known_jobs.contains_key(&11));
        // Job 10 was not in the second poll but stays known.
        assert_eq!(run_one.known_jobs[&10].status, "in_progress");
        assert!(run_one.known_jobs[&10].known_steps.contains_key("Build"));
        assert_eq!(merged.known_runs[&2].status, "queued");
    }

    #[test]
    fn job_state_keys_steps_by_name() {
        let state = JobState::from_snapshot(&job(
            10,
            "in_progress",
            vec![step(1, "Checkout", "completed"), step(2, "Test", "queued")],
        ));
        assert_eq!(state.known_steps.len(), 2);
        assert_eq!(state.known_steps["Checkout"].status, "completed");
        assert_eq!(state.known_steps["Test"].status, "queued");
    }

    #[test]
    fn repeated_step_names_get_ordinal_keys() {
        let steps = vec![
            step(1, "Build", "completed"),
            step(2, "Test", "completed"),
            step(3, "Build", "in_progress"),
            step(4, "Build", "queued"),
        ];
        assert_eq!(step_keys(&steps), vec!["Build", "Test", "Build#2", "Build#3"]);

        let state = JobState::from_snapshot(&job(10, "in_progress", steps));
        assert_eq!(state.known_steps.len(), 4);
        assert_eq!(state.known_steps["Build"].status, "completed");
        assert_eq!(state.known_steps["Build#2"].status, "in_progress");
        assert_eq!(state.known_steps["Build#2"].name, "Build#2");
        assert_eq!(state.known_steps["Build#3"].status, "queued");
    }

    #[test]
    fn state_serializes_to_json() {
        let entry = RunWithJobs {
            run: run(7, "completed", Some("success")),
            jobs: vec![job(70, "completed", vec![step(1, "Build", "completed")])],
        };
        let state = MonitorState::empty().merged(&[entry], Utc::now());
        let json = serde_json::to_string(&state).expect("serialize");
        let back: MonitorState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
