use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(anyhow!("unknown severity: {other}")),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, <Severity as TryFrom<String>>::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    pub message: String,
    pub severity: Severity,
}

impl ReportLine {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// A progress message as returned by an upgrade step.
///
/// Steps may hand back bare text or text with an explicit severity; both are
/// turned into a [`ReportLine`] as soon as the step returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepMessage {
    Text(String),
    Tagged { text: String, severity: Severity },
}

impl StepMessage {
    pub fn into_line(self) -> ReportLine {
        match self {
            Self::Text(text) => ReportLine::new(text, Severity::default()),
            Self::Tagged { text, severity } => ReportLine::new(text, severity),
        }
    }
}

impl From<&str> for StepMessage {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StepMessage {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<S: Into<String>> From<(S, Severity)> for StepMessage {
    fn from((text, severity): (S, Severity)) -> Self {
        Self::Tagged {
            text: text.into(),
            severity,
        }
    }
}

/// Ordered, append-only log of one migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunReport {
    lines: Vec<ReportLine>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>, severity: Severity) {
        self.lines.push(ReportLine::new(message, severity));
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(message, Severity::Debug);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(message, Severity::Info);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(message, Severity::Warning);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(message, Severity::Error);
    }

    pub fn extend_from_step<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = StepMessage>,
    {
        self.lines
            .extend(messages.into_iter().map(StepMessage::into_line));
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn messages(&self) -> Vec<&str> {
        self.lines.iter().map(|line| line.message.as_str()).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.lines
            .iter()
            .any(|line| line.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl IntoIterator for RunReport {
    type Item = ReportLine;
    type IntoIter = std::vec::IntoIter<ReportLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}

impl<'a> IntoIterator for &'a RunReport {
    type Item = &'a ReportLine;
    type IntoIter = std::slice::Iter<'a, ReportLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}
