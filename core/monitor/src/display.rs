//! User-facing output. Diagnostics go through tracing; everything a user
//! watches for (events, heartbeats, the final summary) goes through a sink.

use civiewer_protocol::{Event, EventType};
use colored::Colorize;
use std::io::{self, Write};
use tracing::debug;

use crate::monitor::RunSummary;

pub const HEARTBEAT_LINE: &str = "No new events detected.";

pub trait EventSink {
    /// Writes one preformatted line.
    fn emit(&mut self, line: &str);

    fn event(&mut self, event: &Event) {
        self.emit(&event.format_line());
    }

    fn heartbeat(&mut self) {
        self.emit(HEARTBEAT_LINE);
    }

    /// Lifecycle chatter such as "Resuming from ...".
    fn notice(&mut self, line: &str) {
        self.emit(line);
    }

    fn summary(&mut self, summary: &RunSummary) {
        for line in summary.lines() {
            self.emit(&line);
        }
    }
}

pub struct ConsoleSink<W: Write = io::Stdout> {
    out: W,
    color: bool,
    json: bool,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout(color: bool, json: bool) -> Self {
        Self::new(io::stdout(), color, json)
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W, color: bool, json: bool) -> Self {
        Self { out, color, json }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) {
        if let Err(err) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            debug!(error = %err, "Failed to write output line");
        }
    }

    fn paint_event(&self, event: &Event) -> String {
        let line = event.format_line();
        if !self.color {
            return line;
        }
        if event.is_failure() {
            return line.red().bold().to_string();
        }
        match event.event_type {
            EventType::WorkflowCompleted | EventType::JobCompleted | EventType::StepCompleted => {
                line.green().to_string()
            }
            _ if event.event_type.is_start() => line.cyan().to_string(),
            _ => line,
        }
    }
}

impl<W: Write> EventSink for ConsoleSink<W> {
    fn emit(&mut self, line: &str) {
        self.write_line(line);
    }

    fn event(&mut self, event: &Event) {
        let line = if self.json {
            match serde_json::to_string(event) {
                Ok(json) => json,
                Err(err) => {
                    debug!(error = %err, "Failed to serialize event");
                    return;
                }
            }
        } else {
            self.paint_event(event)
        };
        self.write_line(&line);
    }

    fn heartbeat(&mut self) {
        if self.json {
            return;
        }
        let line = if self.color {
            HEARTBEAT_LINE.dimmed().to_string()
        } else {
            HEARTBEAT_LINE.to_string()
        };
        self.write_line(&line);
    }

    fn notice(&mut self, line: &str) {
        if !self.json {
            self.write_line(line);
        }
    }

    fn summary(&mut self, summary: &RunSummary) {
        if self.json {
            match serde_json::to_string(summary) {
                Ok(json) => self.write_line(&json),
                Err(err) => debug!(error = %err, "Failed to serialize summary"),
            }
            return;
        }
        for line in summary.lines() {
            let line = if self.color && line.starts_with("---") {
                line.bold().to_string()
            } else {
                line
            };
            self.write_line(&line);
        }
    }
}

/// Records everything it is given; used by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub lines: Vec<String>,
    pub events: Vec<Event>,
    pub heartbeats: usize,
    pub summaries: Vec<RunSummary>,
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn emit(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn event(&mut self, event: &Event) {
        self.events.push(event.clone());
        self.emit(&event.format_line());
    }

    fn heartbeat(&mut self) {
        self.heartbeats += 1;
        self.emit(HEARTBEAT_LINE);
    }

    fn summary(&mut self, summary: &RunSummary) {
        self.summaries.push(summary.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use civiewer_protocol::RunSnapshot;

    fn event(event_type: EventType, status: &str, conclusion: Option<&str>) -> Event {
        let at = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        let run = RunSnapshot {
            id: 1,
            name: "CI".to_string(),
            head_branch: "main".to_string(),
            head_sha: "abcdef0123".to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
            created_at: at,
            updated_at: at,
            jobs_url: None,
        };
        Event::for_run(event_type, &run)
    }

    fn output(sink: ConsoleSink<Vec<u8>>) -> String {
        String::from_utf8(sink.into_inner()).expect("utf8 output")
    }

    #[test]
    fn plain_output_is_the_formatted_line() {
        let mut sink = ConsoleSink::new(Vec::new(), false, false);
        sink.event(&event(EventType::WorkflowStarted, "queued", None));
        sink.heartbeat();
        assert_eq!(
            output(sink),
            "[2026-01-30T12:00:00Z] WORKFLOW_STARTED - CI - queued - main@abcdef0\nNo new events detected.\n"
        );
    }

    #[test]
    fn colored_failure_wraps_the_line() {
        colored::control::set_override(true);
        let mut sink = ConsoleSink::new(Vec::new(), true, false);
        sink.event(&event(EventType::WorkflowCompleted, "completed", Some("failure")));
        let text = output(sink);
        assert!(text.starts_with("\u{1b}["));
        assert!(text.contains("WORKFLOW_COMPLETED - CI - completed (failure)"));
    }

    #[test]
    fn json_mode_prints_one_object_per_event_and_skips_heartbeat() {
        let mut sink = ConsoleSink::new(Vec::new(), true, true);
        sink.event(&event(EventType::WorkflowStarted, "queued", None));
        sink.heartbeat();
        sink.notice("Resuming");
        let text = output(sink);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(value["event_type"], "WORKFLOW_STARTED");
        assert_eq!(value["branch"], "main");
    }
}
