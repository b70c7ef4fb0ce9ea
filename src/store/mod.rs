//! Durable last-result-per-operation store with TTL freshness.
//!
//! Layout: `<root>/<Operation>/<Operation>_result.json`. The file's
//! modification time is the freshness stamp and is set explicitly on every
//! write, before the file is renamed into place, so a reader never sees a
//! fresh stamp on partial content.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

use crate::{
    clock::Clock,
    error::{Error, Result},
    operation::Operation,
};

#[derive(Clone)]
pub struct ResultStore {
    root: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("root", &self.root)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { root: root.into(), ttl, clock }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn dir_for(&self, op: Operation) -> PathBuf {
        self.root.join(op.as_str())
    }

    pub fn file_path(&self, op: Operation) -> PathBuf {
        self.dir_for(op).join(format!("{}_result.json", op.as_str()))
    }

    /// False for a first-ever call: the operation's directory is missing or empty.
    pub fn has_entry(&self, op: Operation) -> bool {
        fs::read_dir(self.dir_for(op))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Stamp of the stored result. I/O failures read as "no stamp".
    pub fn created_at(&self, op: Operation) -> Option<SystemTime> {
        match fs::metadata(self.file_path(op)).and_then(|m| m.modified()) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(operation = %op, error = %e, "could not read result timestamp");
                None
            }
        }
    }

    /// Expired once `now` reaches `created_at + ttl`. A stamp ahead of `now`
    /// (the wall clock moved backwards) is expired too.
    pub fn is_expired(&self, created_at: SystemTime) -> bool {
        match self.clock.now().duration_since(created_at) {
            Ok(age) => age >= self.ttl,
            Err(e) => {
                warn!(ahead_secs = e.duration().as_secs(), "result stamp is in the future");
                true
            }
        }
    }

    pub fn read(&self, op: Operation) -> Result<String> {
        fs::read_to_string(self.file_path(op))
            .map_err(|source| Error::StoreRead { operation: op, source })
    }

    pub fn read_fresh(&self, op: Operation) -> Option<String> {
        if !self.has_entry(op) {
            return None;
        }
        let created = self.created_at(op)?;
        if self.is_expired(created) {
            return None;
        }
        match self.read(op) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "treating unreadable result as absent");
                None
            }
        }
    }

    /// Replace the stored result and stamp it with the current time.
    pub fn write(&self, op: Operation, payload: &str) -> Result<SystemTime> {
        let stamp = self.clock.now();
        self.write_inner(op, payload, stamp)
            .map_err(|source| Error::StoreWrite { operation: op, source })?;
        debug!(operation = %op, bytes = payload.len(), "result stored");
        Ok(stamp)
    }

    fn write_inner(&self, op: Operation, payload: &str, stamp: SystemTime) -> io::Result<()> {
        let dir = self.dir_for(op);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.as_file().set_modified(stamp)?;
        tmp.persist(self.file_path(op)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn invalidate(&self, op: Operation) {
        match fs::remove_file(self.file_path(op)) {
            Ok(()) => debug!(operation = %op, "stale result removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(operation = %op, error = %e, "could not remove stale result"),
        }
    }
}
