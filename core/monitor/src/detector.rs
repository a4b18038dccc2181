//! Lifecycle event detection.
//!
//! Compares one poll's snapshot against the previously known tree and returns
//! the edge-triggered transitions, in snapshot order: a run's own event, then
//! for each job its event followed by its steps' events. Pure: no I/O, never
//! fails, absent previous state just means "new".

use civiewer_protocol::{
    is_active, is_completed, is_failure, step_keys, Event, EventType, JobSnapshot, JobState,
    MonitorState, RunSnapshot, RunWithJobs, StepSnapshot, StepState,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// When to report `STEP_STARTED`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum StepStartPolicy {
    /// Only for a step seen for the first time while queued or in progress.
    #[default]
    Discovery,
    /// For any status change into queued or in progress, new or known step.
    Transition,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventDetector {
    step_start: StepStartPolicy,
}

impl EventDetector {
    pub fn new(step_start: StepStartPolicy) -> Self {
        Self { step_start }
    }

    pub fn detect(&self, snapshot: &[RunWithJobs], previous: &MonitorState) -> Vec<Event> {
        let empty_jobs = BTreeMap::new();
        let mut events = Vec::new();

        for entry in snapshot {
            let run = &entry.run;
            let previous_run = previous.known_runs.get(&run.id);

            match previous_run {
                None => events.push(Event::for_run(EventType::WorkflowStarted, run)),
                Some(known) => {
                    if is_completed(&run.status) && !is_completed(&known.status) {
                        events.push(Event::for_run(EventType::WorkflowCompleted, run));
                    }
                }
            }

            let previous_jobs = previous_run
                .map(|known| &known.known_jobs)
                .unwrap_or(&empty_jobs);
            self.detect_jobs(run, &entry.jobs, previous_jobs, &mut events);
        }

        events
    }

    fn detect_jobs(
        &self,
        run: &RunSnapshot,
        jobs: &[JobSnapshot],
        previous_jobs: &BTreeMap<u64, JobState>,
        events: &mut Vec<Event>,
    ) {
        let empty_steps = BTreeMap::new();

        for job in jobs {
            let previous_job = previous_jobs.get(&job.id);

            match previous_job {
                None => {
                    events.push(Event::for_job(EventType::JobStarted, run, job));
                    // Already finished when first seen: report both edges.
                    if is_completed(&job.status) {
                        events.push(Event::for_job(EventType::JobCompleted, run, job));
                    }
                }
                Some(known) => {
                    if is_completed(&job.status) && !is_completed(&known.status) {
                        events.push(Event::for_job(EventType::JobCompleted, run, job));
                    }
                }
            }

            let previous_steps = previous_job
                .map(|known| &known.known_steps)
                .unwrap_or(&empty_steps);
            self.detect_steps(run, job, previous_steps, events);
        }
    }

    fn detect_steps(
        &self,
        run: &RunSnapshot,
        job: &JobSnapshot,
        previous_steps: &BTreeMap<String, StepState>,
        events: &mut Vec<Event>,
    ) {
        // Same keys as the persisted tree, so repeated names compare like with like.
        for (key, step) in step_keys(&job.steps).iter().zip(&job.steps) {
            if let Some(event_type) = self.step_transition(step, previous_steps.get(key)) {
                events.push(Event::for_step(event_type, run, job, step));
            }
        }
    }

    fn step_transition(
        &self,
        step: &StepSnapshot,
        previous: Option<&StepState>,
    ) -> Option<EventType> {
        // Status is the only trigger; a conclusion change alone is ignored.
        let changed = previous
            .map(|known| known.status != step.status)
            .unwrap_or(true);
        if !changed {
            return None;
        }

        if is_completed(&step.status) {
            return if is_failure(step.conclusion.as_deref()) {
                Some(EventType::StepFailed)
            } else {
                Some(EventType::StepCompleted)
            };
        }

        if !is_active(&step.status) {
            return None;
        }

        match self.step_start {
            StepStartPolicy::Discovery if previous.is_none() => Some(EventType::StepStarted),
            StepStartPolicy::Discovery => None,
            StepStartPolicy::Transition => Some(EventType::StepStarted),
        }
    }
}
