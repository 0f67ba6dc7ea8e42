use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use uplift_core::{ReportLine, RunReport, Severity};

/// Destination for report lines once a run is over.
pub trait ReportSink: Send + Sync {
    fn log(&self, message: &str, severity: Severity);
}

/// Forwards report lines as `tracing` events under `uplift::migration`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn log(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Debug => debug!(target: "uplift::migration", "{message}"),
            Severity::Info => info!(target: "uplift::migration", "{message}"),
            Severity::Warning => warn!(target: "uplift::migration", "{message}"),
            Severity::Error => error!(target: "uplift::migration", "{message}"),
        }
    }
}

/// Keeps every logged line; handy when embedding the engine.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<ReportLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<ReportLine> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl ReportSink for MemorySink {
    fn log(&self, message: &str, severity: Severity) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(ReportLine::new(message, severity));
        }
    }
}

pub fn flush_report(sink: &dyn ReportSink, report: &RunReport) {
    for line in report {
        sink.log(&line.message, line.severity);
    }
}
