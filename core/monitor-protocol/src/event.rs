//! Lifecycle events produced by the detector.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{is_completed, is_failure, JobSnapshot, RunSnapshot, StepSnapshot, SHORT_SHA_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    JobStarted,
    JobCompleted,
    StepStarted,
    StepCompleted,
    StepFailed,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::JobStarted,
        EventType::JobCompleted,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "WORKFLOW_STARTED",
            EventType::WorkflowCompleted => "WORKFLOW_COMPLETED",
            EventType::JobStarted => "JOB_STARTED",
            EventType::JobCompleted => "JOB_COMPLETED",
            EventType::StepStarted => "STEP_STARTED",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::StepFailed => "STEP_FAILED",
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowStarted | EventType::JobStarted | EventType::StepStarted
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed lifecycle transition. Branch and commit always come from the
/// owning run, even for job and step events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub workflow_name: String,
    pub job_name: Option<String>,
    pub step_name: Option<String>,
    pub status: String,
    pub conclusion: Option<String>,
    pub branch: String,
    pub commit_sha: String,
}

impl Event {
    pub fn for_run(event_type: EventType, run: &RunSnapshot) -> Self {
        Self {
            event_type,
            timestamp: run.updated_at,
            workflow_name: run.name.clone(),
            job_name: None,
            step_name: None,
            status: run.status.clone(),
            conclusion: run.conclusion.clone(),
            branch: run.head_branch.clone(),
            commit_sha: run.head_sha.clone(),
        }
    }

    pub fn for_job(event_type: EventType, run: &RunSnapshot, job: &JobSnapshot) -> Self {
        Self {
            job_name: Some(job.name.clone()),
            status: job.status.clone(),
            conclusion: job.conclusion.clone(),
            ..Self::for_run(event_type, run)
        }
    }

    pub fn for_step(
        event_type: EventType,
        run: &RunSnapshot,
        job: &JobSnapshot,
        step: &StepSnapshot,
    ) -> Self {
        Self {
            job_name: Some(job.name.clone()),
            step_name: Some(step.name.clone()),
            status: step.status.clone(),
            conclusion: step.conclusion.clone(),
            ..Self::for_run(event_type, run)
        }
    }

    /// Conclusion as shown to users: hidden until the entity has completed.
    pub fn display_conclusion(&self) -> Option<&str> {
        if is_completed(&self.status) {
            self.conclusion.as_deref()
        } else {
            None
        }
    }

    pub fn is_failure(&self) -> bool {
        self.event_type == EventType::StepFailed || is_failure(self.display_conclusion())
    }

    pub fn short_sha(&self) -> &str {
        match self.commit_sha.char_indices().nth(SHORT_SHA_LEN) {
            Some((index, _)) => &self.commit_sha[..index],
            None => &self.commit_sha,
        }
    }

    /// `[ts] TYPE - workflow / job / step - status (conclusion) - branch@sha`
    pub fn format_line(&self) -> String {
        let mut line = format!(
            "[{}] {} - {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.event_type,
            self.workflow_name
        );
        if let Some(job) = &self.job_name {
            line.push_str(" / ");
            line.push_str(job);
        }
        if let Some(step) = &self.step_name {
            line.push_str(" / ");
            line.push_str(step);
        }
        line.push_str(" - ");
        line.push_str(&self.status);
        if let Some(conclusion) = self.display_conclusion() {
            line.push_str(&format!(" ({})", conclusion));
        }
        line.push_str(&format!(" - {}@{}", self.branch, self.short_sha()));
        line
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run(status: &str, conclusion: Option<&str>, sha: &str) -> RunSnapshot {
        let at = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        RunSnapshot {
            id: 1,
            name: "CI".to_string(),
            head_branch: "main".to_string(),
            head_sha: sha.to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            created_at: at,
            updated_at: at,
            jobs_url: None,
        }
    }

    #[test]
    fn formats_workflow_event_with_short_sha() {
        let event = Event::for_run(
            EventType::WorkflowStarted,
            &run("queued", None, "abc123456789"),
        );
        assert_eq!(
            event.format_line(),
            "[2026-01-30T12:00:00Z] WORKFLOW_STARTED - CI - queued - main@abc1234"
        );
    }

    #[test]
    fn keeps_short_sha_intact() {
        let event = Event::for_run(EventType::WorkflowStarted, &run("queued", None, "abc"));
        assert_eq!(event.short_sha(), "abc");
        assert!(event.format_line().ends_with("main@abc"));
    }

    #[test]
    fn formats_step_event_with_conclusion() {
        let run = run("in_progress", None, "0123456789");
        let job = JobSnapshot {
            id: 10,
            name: "build".to_string(),
            status: "in_progress".to_string(),
            conclusion: None,
            steps: vec![],
        };
        let step = StepSnapshot {
            number: 2,
            name: "Test".to_string(),
            status: "completed".to_string(),
            conclusion: Some("failure".to_string()),
        };
        let event = Event::for_step(EventType::StepFailed, &run, &job, &step);
        assert_eq!(
            event.format_line(),
            "[2026-01-30T12:00:00Z] STEP_FAILED - CI / build / Test - completed (failure) - main@0123456"
        );
        assert!(event.is_failure());
    }

    #[test]
    fn hides_conclusion_while_in_progress() {
        let event = Event::for_run(
            EventType::WorkflowStarted,
            &run("in_progress", Some("failure"), "abcdef0"),
        );
        assert_eq!(event.display_conclusion(), None);
        assert!(!event.format_line().contains("failure"));
        assert!(!event.is_failure());
    }

    #[test]
    fn completed_failure_run_is_highlighted() {
        let event = Event::for_run(
            EventType::WorkflowCompleted,
            &run("completed", Some("failure"), "abcdef0"),
        );
        assert!(event.is_failure());
        assert!(event.format_line().contains("completed (failure)"));
    }

    #[test]
    fn event_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&EventType::StepFailed).expect("serialize");
        assert_eq!(json, "\"STEP_FAILED\"");
        for event_type in EventType::ALL {
            let json = serde_json::to_string(&event_type).expect("serialize");
            assert_eq!(json.trim_matches('"'), event_type.as_str());
        }
    }
}
