use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uplift_core::VersionId;

use crate::{remove_file_if_exists, InstanceLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Applying,
    Committed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub status: RunStatus,
    pub started_at_unix: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<VersionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn set_active_run(layout: &InstanceLayout, txid: &str) -> Result<PathBuf> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_run(layout).ok().flatten();
            let detail = existing
                .map(|existing_txid| format!(" (txid={existing_txid})"))
                .unwrap_or_default();
            return Err(anyhow!("another migration run is active{detail}"));
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to claim active run marker: {}", path.display())
            });
        }
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .with_context(|| format!("failed to write active run marker: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush active run marker: {}", path.display()))?;

    Ok(path)
}

pub fn read_active_run(layout: &InstanceLayout) -> Result<Option<String>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active run marker: {}", path.display())
            });
        }
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }
    Ok(Some(txid.to_string()))
}

pub fn clear_active_run(layout: &InstanceLayout) -> Result<()> {
    let path = layout.transaction_active_path();
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to clear active run marker: {}", path.display()))
}

pub fn write_run_metadata(layout: &InstanceLayout, metadata: &RunMetadata) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload =
        serde_json::to_string_pretty(metadata).context("failed serializing run metadata")?;
    fs::write(&path, payload)
        .with_context(|| format!("failed to write run metadata: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_metadata(layout: &InstanceLayout, txid: &str) -> Result<Option<RunMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run metadata: {}", path.display()));
        }
    };

    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing run metadata: {}", path.display()))?;
    Ok(Some(metadata))
}

pub fn update_run_status(layout: &InstanceLayout, txid: &str, status: RunStatus) -> Result<()> {
    let mut metadata = read_run_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("run metadata not found for '{txid}'"))?;
    metadata.status = status;
    write_run_metadata(layout, &metadata)?;
    Ok(())
}

pub fn append_run_journal_entry(
    layout: &InstanceLayout,
    txid: &str,
    entry: &RunJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut line = serde_json::to_string(entry).context("failed serializing journal entry")?;
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open run journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append run journal: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush run journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_journal(layout: &InstanceLayout, txid: &str) -> Result<Vec<RunJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run journal: {}", path.display()));
        }
    };

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid run journal line in {}", path.display()))
        })
        .collect()
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_run_txid(started_at_unix: u64) -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{started_at_unix}-{}-{seq}", std::process::id())
}

/// Writes planning metadata and claims the active run marker. Nothing runs
/// after the claim, so a refused or failed begin never leaves the marker set.
pub fn begin_run_transaction(
    layout: &InstanceLayout,
    operation: &str,
    from_version: Option<&VersionId>,
    started_at_unix: u64,
) -> Result<RunMetadata> {
    let metadata = RunMetadata {
        version: 1,
        txid: next_run_txid(started_at_unix),
        operation: operation.to_string(),
        status: RunStatus::Planning,
        started_at_unix,
        from_version: from_version.cloned(),
    };

    write_run_metadata(layout, &metadata)?;
    if let Err(err) = set_active_run(layout, &metadata.txid) {
        let _ = remove_file_if_exists(&layout.transaction_metadata_path(&metadata.txid));
        return Err(err);
    }

    Ok(metadata)
}

/// Sequenced writer over one run's journal file.
#[derive(Debug)]
pub struct RunJournal {
    layout: InstanceLayout,
    txid: String,
    next_seq: u64,
}

impl RunJournal {
    pub fn new(layout: InstanceLayout, txid: impl Into<String>) -> Self {
        Self {
            layout,
            txid: txid.into(),
            next_seq: 1,
        }
    }

    pub fn record(&mut self, step: &str, state: &str, detail: Option<String>) -> Result<()> {
        append_run_journal_entry(
            &self.layout,
            &self.txid,
            &RunJournalEntry {
                seq: self.next_seq,
                step: step.to_string(),
                state: state.to_string(),
                detail,
            },
        )?;
        self.next_seq += 1;
        Ok(())
    }
}
