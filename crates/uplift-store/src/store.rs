use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fs_utils::write_atomically;
use crate::{state_format_version, ConflictError, InstanceLayout, InstanceState, StoreError};

/// Transactional access to the persisted instance state.
///
/// Upgrade steps mutate the working copy returned by [`StateStore::state_mut`].
/// Nothing is persisted until [`StateStore::commit`]; [`StateStore::abort`]
/// drops every change made since the last commit.
pub trait StateStore {
    fn state(&self) -> &InstanceState;

    fn state_mut(&mut self) -> &mut InstanceState;

    /// Persists the working state. A commit with no content change is a no-op.
    fn commit(&mut self) -> Result<(), StoreError>;

    fn abort(&mut self) -> Result<(), StoreError>;

    /// Captures the committed state as the run baseline. During a dry run
    /// commits only reach memory.
    fn begin_run(&mut self, dry_run: bool) -> Result<(), StoreError>;

    /// Ends the run and drops uncommitted changes. A dry run also loses its
    /// in-memory commits; commits of a real run are durable and stay.
    fn rollback_run(&mut self) -> Result<(), StoreError>;

    /// Ends the run and keeps what was committed. Finishing a dry run rolls it back.
    fn finish_run(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct Slots {
    committed: InstanceState,
    working: InstanceState,
    baseline: Option<InstanceState>,
    dry_run: bool,
}

impl Slots {
    fn new(state: InstanceState) -> Self {
        Self {
            committed: state.clone(),
            working: state,
            baseline: None,
            dry_run: false,
        }
    }

    fn rollback_run(&mut self) {
        let was_dry_run = std::mem::replace(&mut self.dry_run, false);
        match self.baseline.take() {
            Some(baseline) if was_dry_run => self.accept(baseline),
            _ => self.working = self.committed.clone(),
        }
    }

    fn is_dirty(&self) -> bool {
        !self.working.same_content(&self.committed)
    }

    fn staged_commit(&self) -> InstanceState {
        let mut next = self.working.clone();
        next.serial = self.committed.serial + 1;
        next
    }

    fn accept(&mut self, state: InstanceState) {
        self.working = state.clone();
        self.committed = state;
    }
}

#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    slots: Slots,
}

impl FileStateStore {
    pub fn open(layout: &InstanceLayout) -> Result<Self, StoreError> {
        let path = layout.instance_state_path();
        let state = read_state_file(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            slots: Slots::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed(&self) -> &InstanceState {
        &self.slots.committed
    }

    fn persist(&self, state: &InstanceState) -> Result<(), StoreError> {
        let expected = self.slots.committed.serial;
        let found = read_state_file(&self.path)?
            .map(|on_disk| on_disk.serial)
            .unwrap_or(0);
        if found != expected {
            return Err(ConflictError::new(self.path.display().to_string(), expected, found).into());
        }

        let payload = serde_json::to_vec_pretty(state).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        write_atomically(&self.path, &payload)
            .map_err(|source| StoreError::io("write instance state", &self.path, source))?;
        debug!(path = %self.path.display(), serial = state.serial, "committed instance state");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn state(&self) -> &InstanceState {
        &self.slots.working
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.slots.working
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.slots.is_dirty() {
            return Ok(());
        }

        let next = self.slots.staged_commit();
        if !self.slots.dry_run {
            self.persist(&next)?;
        }
        self.slots.accept(next);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), StoreError> {
        self.slots.working = self.slots.committed.clone();
        Ok(())
    }

    fn begin_run(&mut self, dry_run: bool) -> Result<(), StoreError> {
        self.slots.baseline = Some(self.slots.committed.clone());
        self.slots.dry_run = dry_run;
        Ok(())
    }

    fn rollback_run(&mut self) -> Result<(), StoreError> {
        self.slots.rollback_run();
        Ok(())
    }

    fn finish_run(&mut self) -> Result<(), StoreError> {
        if self.slots.dry_run {
            return self.rollback_run();
        }
        self.slots.baseline = None;
        Ok(())
    }
}

fn read_state_file(path: &Path) -> Result<Option<InstanceState>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io("read instance state", path, err)),
    };

    let state: InstanceState =
        serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if state.format != state_format_version() {
        return Err(StoreError::UnsupportedFormat {
            found: state.format,
            expected: state_format_version(),
        });
    }
    Ok(Some(state))
}

/// In-memory store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slots: Slots,
    commits: usize,
    conflict_on_next_commit: bool,
}

impl MemoryStateStore {
    pub fn new(state: InstanceState) -> Self {
        Self {
            slots: Slots::new(state),
            commits: 0,
            conflict_on_next_commit: false,
        }
    }

    pub fn committed(&self) -> &InstanceState {
        &self.slots.committed
    }

    /// Number of commits that changed the committed state outside dry runs.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Makes the next effective commit fail as if another writer got there first.
    pub fn inject_conflict(&mut self) {
        self.conflict_on_next_commit = true;
    }
}

impl StateStore for MemoryStateStore {
    fn state(&self) -> &InstanceState {
        &self.slots.working
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.slots.working
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.slots.is_dirty() {
            return Ok(());
        }
        if std::mem::take(&mut self.conflict_on_next_commit) {
            let expected = self.slots.committed.serial;
            return Err(ConflictError::new("memory", expected, expected + 1).into());
        }

        let next = self.slots.staged_commit();
        if !self.slots.dry_run {
            self.commits += 1;
        }
        self.slots.accept(next);
        Ok(())
    }

    fn abort(&mut self) -> Result<(), StoreError> {
        self.slots.working = self.slots.committed.clone();
        Ok(())
    }

    fn begin_run(&mut self, dry_run: bool) -> Result<(), StoreError> {
        self.slots.baseline = Some(self.slots.committed.clone());
        self.slots.dry_run = dry_run;
        Ok(())
    }

    fn rollback_run(&mut self) -> Result<(), StoreError> {
        self.slots.rollback_run();
        Ok(())
    }

    fn finish_run(&mut self) -> Result<(), StoreError> {
        if self.slots.dry_run {
            return self.rollback_run();
        }
        self.slots.baseline = None;
        Ok(())
    }
}
