//! Migration progress reporting.
//!
//! Reports observable progress during a migration run so operators see how
//! much is left per task (pre-migration and per-type pipelines). Progress
//! is emitted on **stderr** so stdout remains parseable for scripts, and
//! is never consulted for correctness.

use std::io::Write;

/// State of a progress-tracked task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Running,
    Completed,
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A task started; total is the expected number of items.
    Started { task: String, total: u64 },
    /// The expected total changed (negative deltas are boundary-duplicate
    /// corrections during extraction).
    Adjusted { task: String, total: u64 },
    /// n items done out of total.
    Advanced { task: String, done: u64, total: u64 },
    /// Task finished.
    Finished { task: String, done: u64, total: u64 },
}

/// Reports migration progress. Implementations write to stderr
/// (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called at batch boundaries.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// "migrate package  1,234 / 5,000 items".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started { task, total } => {
                format!("{}  starting  {} items\n", task, format_number(*total))
            }
            ProgressEvent::Adjusted { task, total } => {
                format!("{}  adjusted  {} items\n", task, format_number(*total))
            }
            ProgressEvent::Advanced { task, done, total } => {
                format!(
                    "{}  {} / {} items\n",
                    task,
                    format_number(*done),
                    format_number(*total)
                )
            }
            ProgressEvent::Finished { task, done, total } => {
                format!(
                    "{}  done  {} / {} items\n",
                    task,
                    format_number(*done),
                    format_number(*total)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started { task, total } => serde_json::json!({
                "event": "progress", "task": task, "phase": "started", "total": total
            }),
            ProgressEvent::Adjusted { task, total } => serde_json::json!({
                "event": "progress", "task": task, "phase": "adjusted", "total": total
            }),
            ProgressEvent::Advanced { task, done, total } => serde_json::json!({
                "event": "progress", "task": task, "phase": "running",
                "done": done, "total": total
            }),
            ProgressEvent::Finished { task, done, total } => serde_json::json!({
                "event": "progress", "task": task, "phase": "completed",
                "done": done, "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Counter for one progress-tracked task. Owns `total`/`done` and forwards
/// batch-boundary deltas to the reporter.
pub struct ProgressCounter<'a> {
    task: String,
    reporter: &'a dyn ProgressReporter,
    total: u64,
    done: u64,
    state: RunState,
}

impl<'a> ProgressCounter<'a> {
    pub fn start(reporter: &'a dyn ProgressReporter, task: impl Into<String>, total: u64) -> Self {
        let task = task.into();
        reporter.report(ProgressEvent::Started {
            task: task.clone(),
            total,
        });
        Self {
            task,
            reporter,
            total,
            done: 0,
            state: RunState::Running,
        }
    }

    /// Negative total correction: an item turned out to be already
    /// migrated and is excluded from this run.
    pub fn deduct(&mut self, n: u64) {
        self.total = self.total.saturating_sub(n);
        self.reporter.report(ProgressEvent::Adjusted {
            task: self.task.clone(),
            total: self.total,
        });
    }

    pub fn advance(&mut self, n: u64) {
        self.done += n;
        self.reporter.report(ProgressEvent::Advanced {
            task: self.task.clone(),
            done: self.done,
            total: self.total,
        });
    }

    pub fn finish(&mut self) {
        self.state = RunState::Completed;
        self.reporter.report(ProgressEvent::Finished {
            task: self.task.clone(),
            done: self.done,
            total: self.total,
        });
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn state(&self) -> RunState {
        self.state
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn counter_tracks_corrections() {
        let reporter = NoProgress;
        let mut counter = ProgressCounter::start(&reporter, "migrate package", 10);
        counter.deduct(2);
        counter.advance(8);
        counter.finish();
        assert_eq!(counter.total(), 8);
        assert_eq!(counter.done(), 8);
        assert_eq!(counter.state(), RunState::Completed);
    }

    #[test]
    fn deduct_saturates_at_zero() {
        let reporter = NoProgress;
        let mut counter = ProgressCounter::start(&reporter, "t", 1);
        counter.deduct(5);
        assert_eq!(counter.total(), 0);
    }
}
