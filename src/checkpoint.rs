//! Checkpoint storage, a durable record of the last replayed oplog timestamp.
//!
//! The MongoDB backed store lives in [crate::blocking::MongoCheckpointStore], this module
//! holds the trait and the resume file store.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bson::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// Read-one / write-one storage of the last applied timestamp.
pub trait CheckpointStore {
    /// Load the checkpoint, None when it was never written.
    fn load(&self) -> Result<Option<Timestamp>>;

    /// Overwrite the checkpoint with `ts`, it must be durable when this returns Ok.
    fn save(&self, ts: Timestamp) -> Result<()>;
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for Box<T> {
    fn load(&self) -> Result<Option<Timestamp>> {
        (**self).load()
    }

    fn save(&self, ts: Timestamp) -> Result<()> {
        (**self).save(ts)
    }
}

impl<T: CheckpointStore + ?Sized> CheckpointStore for &T {
    fn load(&self) -> Result<Option<Timestamp>> {
        (**self).load()
    }

    fn save(&self, ts: Timestamp) -> Result<()> {
        (**self).save(ts)
    }
}

/// Resume file content: `{"ts": {"time": 1620000000, "inc": 3}}`.
#[derive(Serialize, Deserialize, Debug)]
struct ResumeFile {
    ts: ResumeTs,
}

#[derive(Serialize, Deserialize, Debug)]
struct ResumeTs {
    time: u32,
    inc: u32,
}

/// Checkpoint saved in a local json file.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    /// create a store which reads and writes `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCheckpoint { path: path.into() }
    }

    /// resume file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> Result<Option<Timestamp>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let saved: ResumeFile = serde_json::from_str(&content)?;
        Ok(Some(Timestamp {
            time: saved.ts.time,
            increment: saved.ts.inc,
        }))
    }

    fn save(&self, ts: Timestamp) -> Result<()> {
        let content = serde_json::to_string(&ResumeFile {
            ts: ResumeTs {
                time: ts.time,
                inc: ts.increment,
            },
        })?;

        // write aside and rename, so a crash never leaves a half written file.
        let tmp_path = self.tmp_path();
        let mut file = File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        debug!(path = ?self.path, ?ts, "Write resume file.");
        Ok(())
    }
}
