//! Durable transaction decision log.
//!
//! The log records the coordinator's irreversible decisions. A `Prepared`
//! entry is written before any commit directive leaves the manager, and a
//! `RolledBack` entry before any rollback directive; entries are removed
//! only after every branch has acknowledged the outcome. Entries found in
//! the store at startup are therefore exactly the in-doubt transactions.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use xatmi_core::{Result, XatmiError, Xid};

/// Durable state of a logged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Every branch voted yes; the transaction will commit.
    Prepared,
    /// Commit acknowledged by every branch.
    Committed,
    /// The transaction will roll back.
    RolledBack,
}

/// One branch of a logged transaction.
///
/// Process handles are ephemeral and useless after a restart, so only
/// the branch trid and the stable resource id are recorded; recovery
/// re-addresses the directive to whichever instance serves the resource
/// then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Branch transaction identifier handed to the resource.
    pub trid: Xid,
    /// Resource id, or 0 for a remote domain branch.
    pub resource: i32,
}

/// One logged transaction decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Global transaction identifier.
    pub trid: Xid,
    /// The decision in force for the transaction.
    pub state: Decision,
    /// Branches enlisted when the decision was made.
    pub branches: Vec<BranchRecord>,
}

/// Backing store for log entries.
///
/// `write` must be durable before it returns; the two-phase protocol
/// leans on that ordering.
pub trait LogStore: Send {
    /// Writes or updates the entry for `entry.trid`.
    fn write(&mut self, entry: &LogEntry) -> Result<()>;

    /// Removes the entry for the transaction, if present.
    fn remove(&mut self, trid: &Xid) -> Result<()>;

    /// Snapshot of the current entries, one per transaction.
    fn entries(&self) -> Vec<LogEntry>;
}

/// Volatile store for tests and single-run tooling.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Vec<LogEntry>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for InMemoryStore {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        match self.entries.iter_mut().find(|e| e.trid == entry.trid) {
            Some(existing) => *existing = entry.clone(),
            None => self.entries.push(entry.clone()),
        }
        Ok(())
    }

    fn remove(&mut self, trid: &Xid) -> Result<()> {
        self.entries.retain(|e| e.trid != *trid);
        Ok(())
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }
}

/// One record in the append-only file; `state: None` is a removal.
#[derive(Serialize, Deserialize)]
struct FileRecord {
    trid: Xid,
    state: Option<Decision>,
    #[serde(default)]
    branches: Vec<BranchRecord>,
}

/// Append-only file store, one JSON record per line.
///
/// The live set is kept in memory and rebuilt from the file on open by
/// folding records in order, so a crash between append and fold never
/// loses a decision.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    entries: Vec<LogEntry>,
}

impl FileStore {
    /// Opens (or creates) the log file and replays its records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries: Vec<LogEntry> = Vec::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: FileRecord = serde_json::from_str(&line).map_err(|e| {
                    XatmiError::Log(format!("corrupt log record in {}: {}", path.display(), e))
                })?;
                match record.state {
                    Some(state) => {
                        let entry = LogEntry {
                            trid: record.trid,
                            state,
                            branches: record.branches,
                        };
                        match entries.iter_mut().find(|e| e.trid == entry.trid) {
                            Some(existing) => *existing = entry,
                            None => entries.push(entry),
                        }
                    }
                    None => entries.retain(|e| e.trid != record.trid),
                }
            }
            info!(path = %path.display(), entries = entries.len(), "replayed transaction log");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            entries,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &FileRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| XatmiError::Log(format!("encode log record: {}", e)))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl LogStore for FileStore {
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        self.append(&FileRecord {
            trid: entry.trid.clone(),
            state: Some(entry.state),
            branches: entry.branches.clone(),
        })?;
        match self.entries.iter_mut().find(|e| e.trid == entry.trid) {
            Some(existing) => *existing = entry.clone(),
            None => self.entries.push(entry.clone()),
        }
        Ok(())
    }

    fn remove(&mut self, trid: &Xid) -> Result<()> {
        self.append(&FileRecord {
            trid: trid.clone(),
            state: None,
            branches: Vec::new(),
        })?;
        self.entries.retain(|e| e.trid != *trid);
        Ok(())
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }
}

/// Coordinator-facing view of the decision log.
#[derive(Debug)]
pub struct Log<S: LogStore> {
    store: S,
}

impl<S: LogStore> Log<S> {
    /// Wraps a backing store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Records that every branch voted yes and the transaction will
    /// commit. Must complete before any commit directive is dispatched.
    pub fn prepare(&mut self, trid: &Xid, branches: Vec<BranchRecord>) -> Result<()> {
        debug!(%trid, branches = branches.len(), "logging prepared");
        self.store.write(&LogEntry {
            trid: trid.clone(),
            state: Decision::Prepared,
            branches,
        })
    }

    /// Records that every branch acknowledged commit, preserving the
    /// branch list of the prepared entry.
    pub fn committed(&mut self, trid: &Xid) -> Result<()> {
        debug!(%trid, "logging committed");
        let branches = self
            .store
            .entries()
            .into_iter()
            .find(|e| e.trid == *trid)
            .map(|e| e.branches)
            .unwrap_or_default();
        self.store.write(&LogEntry {
            trid: trid.clone(),
            state: Decision::Committed,
            branches,
        })
    }

    /// Records the decision to roll back. Must complete before any
    /// rollback directive is dispatched.
    pub fn rolled_back(&mut self, trid: &Xid, branches: Vec<BranchRecord>) -> Result<()> {
        debug!(%trid, "logging rolled back");
        self.store.write(&LogEntry {
            trid: trid.clone(),
            state: Decision::RolledBack,
            branches,
        })
    }

    /// Releases the entry once every branch reached the decided outcome.
    pub fn remove(&mut self, trid: &Xid) -> Result<()> {
        debug!(%trid, "removing log entry");
        self.store.remove(trid)
    }

    /// Every currently logged entry.
    pub fn logged(&self) -> Vec<LogEntry> {
        self.store.entries()
    }

    /// Entries whose outcome is not yet known to have reached every
    /// branch. At startup these drive recovery.
    pub fn in_doubt(&self) -> Vec<LogEntry> {
        self.store.entries()
    }
}
