//! Run progress reporting.
//!
//! Reports observable progress during `cidx run` so users see which stage a
//! resource is in and how many items are left to recognize. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::{IsTerminal, Write};

/// Pipeline phase of one resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    Fetching,
    Recognizing,
    Expanding,
    Aggregating,
    Sorting,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Fetching => "fetching",
            RunPhase::Recognizing => "recognizing",
            RunPhase::Expanding => "expanding",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Sorting => "sorting",
        }
    }
}

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// A phase started; no counts known.
    Phase { resource: String, phase: RunPhase },
    /// Recognition: n items processed out of total.
    Recognizing {
        resource: String,
        n: u64,
        total: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run GEO  recognizing  1,234 / 5,000 items".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Phase { resource, phase } => {
                format!("run {}  {}...\n", resource, phase.as_str())
            }
            RunProgressEvent::Recognizing { resource, n, total } => format!(
                "run {}  recognizing  {} / {} items\n",
                resource,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Phase { resource, phase } => serde_json::json!({
                "event": "progress",
                "resource": resource,
                "phase": phase.as_str()
            }),
            RunProgressEvent::Recognizing { resource, n, total } => serde_json::json!({
                "event": "progress",
                "resource": resource,
                "phase": RunPhase::Recognizing.as_str(),
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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
    /// JSON when JSON logs are on, human when stderr is a terminal,
    /// otherwise off.
    pub fn detect(json: bool) -> Self {
        if json {
            ProgressMode::Json
        } else if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
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
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_mode_wins() {
        assert_eq!(ProgressMode::detect(true), ProgressMode::Json);
    }
}
