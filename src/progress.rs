//! Harvest progress reporting.
//!
//! Shows which key is being fetched and how far the run has come. Progress
//! goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a harvest run.
#[derive(Clone, Debug)]
pub enum HarvestProgressEvent {
    /// Checkpoints loaded; `pending` keys still need work.
    Starting {
        job: String,
        candidates: u64,
        pending: u64,
    },
    /// Key number `n` of `total` pending keys has been processed.
    Processed {
        job: String,
        key: String,
        status: &'static str,
        n: u64,
        total: u64,
    },
}

pub trait HarvestProgressReporter: Send + Sync {
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress: "harvest catalog  1,234 / 5,000 keys  (570 success)".
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = match &event {
            HarvestProgressEvent::Starting {
                job,
                candidates,
                pending,
            } => format!(
                "harvest {}  {} candidates, {} pending\n",
                job,
                format_number(*candidates),
                format_number(*pending)
            ),
            HarvestProgressEvent::Processed {
                job,
                key,
                status,
                n,
                total,
            } => format!(
                "harvest {}  {} / {} keys  ({} {})\n",
                job,
                format_number(*n),
                format_number(*total),
                key,
                status
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let obj = match &event {
            HarvestProgressEvent::Starting {
                job,
                candidates,
                pending,
            } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "starting",
                "candidates": candidates,
                "pending": pending
            }),
            HarvestProgressEvent::Processed {
                job,
                key,
                status,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "processing",
                "key": key,
                "status": status,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
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
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
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
        assert_eq!(format_number(60_000), "60,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
