//! Per-interval CSV log
//!
//! One header line written when the log is opened, then one row per control
//! invocation. A failed write disables the log; control carries on.

use crate::control::IntervalReport;
use crate::models::{Channel, PerformanceMetric};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct IntervalLog {
    path: PathBuf,
    file: Option<File>,
    channels: Vec<Channel>,
    metrics: Vec<PerformanceMetric>,
}

fn field(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{}", v),
        _ => String::new(),
    }
}

impl IntervalLog {
    /// Create (truncating) the log at `path` and write its header
    pub fn create(
        path: impl AsRef<Path>,
        channels: Vec<Channel>,
        metrics: Vec<PerformanceMetric>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create interval log {}", path.display()))?;
        let mut log = Self {
            path,
            file: Some(file),
            channels,
            metrics,
        };
        let header = log.header();
        log.write_line(&header)
            .with_context(|| format!("Failed to write header to {}", log.path.display()))?;
        debug!(path = %log.path.display(), "Opened interval log");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    fn header(&self) -> String {
        let mut columns = vec!["\"ts\"".to_string()];
        for (entity, category) in &self.channels {
            for name in ["Share(k-1)", "Util(k-1)", "Residual(k-1)", "Delta(k)", "Share(k)"] {
                columns.push(format!("\"{}_{}_{}\"", entity, category, name));
            }
        }
        for metric in &self.metrics {
            for name in ["Reference", "Measured", "RelativeError"] {
                columns.push(format!("\"{}_{}\"", metric, name));
            }
        }
        for name in ["Controls", "SkipControls", "FailControls", "ElapsedMicros"] {
            columns.push(format!("\"{}\"", name));
        }
        columns.join(",")
    }

    fn row(&self, report: &IntervalReport, targets: &BTreeMap<PerformanceMetric, f64>) -> String {
        let mut row = report.timestamp.to_string();
        let decisions = report.outcome.decisions();
        for (entity, category) in &self.channels {
            let measurement = report.measurement(entity, *category);
            let decision = decisions
                .iter()
                .find(|d| d.entity == *entity && d.category == *category);
            let _ = write!(
                row,
                ",{},{},{},{},{}",
                field(measurement.map(|m| m.old_share)),
                field(measurement.map(|m| m.utilization)),
                field(measurement.map(|m| m.residual)),
                field(decision.map(|d| d.effective_share() - d.old_share)),
                field(decision.map(|d| d.effective_share()).or(measurement.map(|m| m.old_share))),
            );
        }
        for metric in &self.metrics {
            let _ = write!(
                row,
                ",{},{},{}",
                field(targets.get(metric).copied()),
                field(report.measured.get(metric).copied()),
                field(report.errors.get(metric).copied()),
            );
        }
        let _ = write!(
            row,
            ",{},{},{},{}",
            report.state.control_count,
            report.state.skip_count,
            report.state.fail_count,
            report.elapsed_micros
        );
        row
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    /// Append the row of `report`; disables the log on failure
    pub fn record(&mut self, report: &IntervalReport, targets: &BTreeMap<PerformanceMetric, f64>) {
        if self.file.is_none() {
            return;
        }
        let row = self.row(report, targets);
        if let Err(e) = self.write_line(&row) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Interval log write failed, disabling log"
            );
            self.file = None;
        }
    }
}
