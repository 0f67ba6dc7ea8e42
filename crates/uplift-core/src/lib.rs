mod report;
mod version;

pub use report::{ReportLine, RunReport, Severity, StepMessage};
pub use version::{ReleaseLevel, VersionId, VersionTuple};
