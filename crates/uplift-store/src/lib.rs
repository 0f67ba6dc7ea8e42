mod error;
mod fs_utils;
mod layout;
mod state;
mod store;
mod transactions;

pub use error::{ConflictError, StoreError};
pub use fs_utils::remove_file_if_exists;
pub use layout::{default_instance_root, InstanceLayout};
pub use state::{state_format_version, InstanceState};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use transactions::{
    append_run_journal_entry, begin_run_transaction, clear_active_run, current_unix_timestamp,
    read_active_run, read_run_journal, read_run_metadata, set_active_run, update_run_status,
    write_run_metadata, RunJournal, RunJournalEntry, RunMetadata, RunStatus,
};

#[cfg(test)]
mod tests;
