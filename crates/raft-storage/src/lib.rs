//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: receives the encoded state from raft-core's persist module, driven by raft-runtime
//! what: Storage trait, FileStorage implementation, InMemoryStorage for tests and simulated restarts

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::EncodedState;

/// trait for durable storage of raft state
///
/// the three blobs are opaque to the backend; raft-core decides what they
/// contain and when they are written. a successful `save` must survive a
/// crash, and must replace all three parts together.
pub trait Storage: Send {
    /// persist term, voted_for and log as one atomic unit
    fn save(&mut self, term: &[u8], voted_for: &[u8], log: &[u8]) -> io::Result<()>;

    /// load the last saved state, `None` for a node that never saved
    fn load(&self) -> io::Result<Option<EncodedState>>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with a single `state.json` holding
/// the three encoded parts
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// get the path to the state file
    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("state.tmp")
    }
}

impl Storage for FileStorage {
    fn save(&mut self, term: &[u8], voted_for: &[u8], log: &[u8]) -> io::Result<()> {
        let state = EncodedState {
            term: term.to_vec(),
            voted_for: voted_for.to_vec(),
            log: log.to_vec(),
        };
        let json = serde_json::to_vec(&state).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        // the rename is only durable once the directory entry is
        sync_dir(&self.dir)?;

        Ok(())
    }

    fn load(&self) -> io::Result<Option<EncodedState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None); // fresh node
        }

        let mut file = File::open(&path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let state: EncodedState =
            serde_json::from_slice(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(state))
    }

    fn clear(&mut self) -> io::Result<()> {
        remove_if_exists(&self.state_path())?;
        remove_if_exists(&self.temp_path())?;
        sync_dir(&self.dir)
    }
}

/// remove a file, treating an already missing one as success
fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// flush directory metadata (creates, renames, removals) to disk
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// directories cannot be opened as files here; renames are flushed by the os
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// clones share the same slot, so a test can hand one clone to a node,
/// drop the node and start a new one from another clone to simulate a
/// restart
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<Option<EncodedState>>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// number of bytes currently held, 0 if nothing was saved
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.term.len() + s.voted_for.len() + s.log.len())
            .unwrap_or(0)
    }
}

impl Storage for InMemoryStorage {
    fn save(&mut self, term: &[u8], voted_for: &[u8], log: &[u8]) -> io::Result<()> {
        *self.state.lock() = Some(EncodedState {
            term: term.to_vec(),
            voted_for: voted_for.to_vec(),
            log: log.to_vec(),
        });
        Ok(())
    }

    fn load(&self) -> io::Result<Option<EncodedState>> {
        Ok(self.state.lock().clone())
    }

    fn clear(&mut self) -> io::Result<()> {
        *self.state.lock() = None;
        Ok(())
    }
}
