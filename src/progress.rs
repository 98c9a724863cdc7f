//! Publish progress reporting.
//!
//! Reports which dashboard is being generated and how many are left so
//! users can follow a long `dashpub publish`. Progress is emitted on
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a publish run.
#[derive(Clone, Debug)]
pub enum PublishProgressEvent {
    /// Dashboard `n` of `total` is being loaded and assembled.
    Generating { dashboard: String, n: u64, total: u64 },
    /// Dashboard finished; `assets` references were resolved, `failed` were not.
    Generated {
        dashboard: String,
        assets: u64,
        failed: u64,
    },
    /// Dashboard could not be published at all.
    Failed { dashboard: String, error: String },
    /// Manifests are being written.
    WritingManifests { datasources: u64, dashboards: u64 },
}

/// Reports publish progress. Implementations write to stderr (human or JSON).
pub trait PublishProgressReporter: Send + Sync {
    fn report(&self, event: PublishProgressEvent);
}

/// Human-friendly progress on stderr: "publish ops_overview  generating  2 / 14".
pub struct StderrProgress;

impl PublishProgressReporter for StderrProgress {
    fn report(&self, event: PublishProgressEvent) {
        let line = match &event {
            PublishProgressEvent::Generating { dashboard, n, total } => format!(
                "publish {}  generating  {} / {}\n",
                dashboard,
                format_number(*n),
                format_number(*total)
            ),
            PublishProgressEvent::Generated {
                dashboard,
                assets,
                failed,
            } => {
                if *failed > 0 {
                    format!(
                        "publish {}  done  {} assets, {} failed\n",
                        dashboard, assets, failed
                    )
                } else {
                    format!("publish {}  done  {} assets\n", dashboard, assets)
                }
            }
            PublishProgressEvent::Failed { dashboard, error } => {
                format!("publish {}  FAILED  {}\n", dashboard, error)
            }
            PublishProgressEvent::WritingManifests {
                datasources,
                dashboards,
            } => format!(
                "publish  writing manifests  {} datasources, {} dashboards\n",
                format_number(*datasources),
                format_number(*dashboards)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl PublishProgressReporter for JsonProgress {
    fn report(&self, event: PublishProgressEvent) {
        let obj = match &event {
            PublishProgressEvent::Generating { dashboard, n, total } => serde_json::json!({
                "event": "progress",
                "dashboard": dashboard,
                "phase": "generating",
                "n": n,
                "total": total
            }),
            PublishProgressEvent::Generated {
                dashboard,
                assets,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "dashboard": dashboard,
                "phase": "generated",
                "assets": assets,
                "failed": failed
            }),
            PublishProgressEvent::Failed { dashboard, error } => serde_json::json!({
                "event": "error",
                "dashboard": dashboard,
                "error": error
            }),
            PublishProgressEvent::WritingManifests {
                datasources,
                dashboards,
            } => serde_json::json!({
                "event": "progress",
                "phase": "manifests",
                "datasources": datasources,
                "dashboards": dashboards
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

impl PublishProgressReporter for NoProgress {
    fn report(&self, _event: PublishProgressEvent) {}
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
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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

    pub fn reporter(&self) -> Box<dyn PublishProgressReporter> {
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
}
