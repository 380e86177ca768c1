//! Terminal rendering of job events.

use volley_dispatch::{
    Event, JobSnapshot, JobState, Severity,
    events::{LogEvent, ProgressEvent},
};

fn tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "INFO ",
        Severity::Success => "OK   ",
        Severity::Warning => "WARN ",
        Severity::Error => "ERROR",
    }
}

/// One line per event. Outcomes are left out: the log lines already say
/// what happened to each recipient.
pub fn format_event(event: &Event) -> Option<String> {
    match event {
        Event::Log(LogEvent { message, severity }) => Some(format!("[{}] {message}", tag(*severity))),
        Event::Progress(progress) => Some(format_progress(progress)),
        Event::Outcome(_) => None,
    }
}

pub fn format_progress(progress: &ProgressEvent) -> String {
    let done = progress.sent + progress.failed;
    format!(
        "[{done:>width$}/{}] sent {}, failed {}, remaining {}, relays active {}",
        progress.total,
        progress.sent,
        progress.failed,
        progress.remaining,
        progress.active_relay_count,
        width = progress.total.to_string().len()
    )
}

pub fn format_summary(snapshot: &JobSnapshot) -> String {
    let state = match snapshot.state {
        JobState::Completed => "completed",
        JobState::Aborted => "stopped",
        JobState::Running => "running",
        JobState::Submitted => "submitted",
    };

    format!(
        "Job {} {state}: {} sent, {} failed, {} not processed (of {})",
        snapshot.id, snapshot.sent, snapshot.failed, snapshot.remaining, snapshot.total
    )
}
