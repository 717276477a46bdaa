use std::fmt;
use std::result::Result as StdResult;

use bson::document::ValueAccessError;
use bson::{Document, Timestamp};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

/// Server error codes which mean the node went away or changed role under us.
const NETWORK_ERROR_CODES: [i32; 9] = [6, 7, 89, 91, 189, 10107, 11600, 11602, 13435];

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Mongodb error: {0}")]
    MongoError(#[from] MongoError),
    #[error("Bson value access error: {0}")]
    BsonError(#[from] ValueAccessError),
    #[error("Check permission for database {db:?} failed, connection string: {uri:?}, detailed: {detail:?}")]
    PermissionError {
        uri: String,
        db: String,
        detail: MongoError,
    },
    #[error("Checkpoint {checkpoint:?} is older than the earliest retained oplog entry {earliest:?}, the gap can't be replayed, resync or reset the checkpoint manually")]
    CheckpointTooOld {
        checkpoint: Timestamp,
        earliest: Timestamp,
    },
    #[error("Oplog collection {0:?} doesn't exist, is the source a replica set member?")]
    MissingOplog(String),
    #[error("Malformed oplog entry: {0}")]
    MalformedEntry(String),
    #[error("Invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("Invalid rename rule {rule:?}: {reason}")]
    InvalidRename { rule: String, reason: &'static str },
    #[error("Invalid configuration file: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Checkpoint file content is invalid: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Source and destination are the same deployment, it's only allowed when every include namespace is renamed")]
    SameInstance,
    #[error("Destination {0:?} is a mongos router, oplog entries can't be applied there")]
    DestinationIsMongos(String),
    #[error("Oplog reader thread panicked")]
    ReaderPanicked,
    #[error("Apply oplog failed, server reply: {0:?}")]
    ApplyOplogError(Document),
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Wrap `self` with the run `stage` it happened in.
    pub fn at(self, stage: Stage) -> SyncError {
        match self {
            // keep the innermost stage.
            e @ SyncError::Stage { .. } => e,
            e => SyncError::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The stage a run failed in, if the error has been tagged with one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SyncError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Is this error a connectivity problem (unreachable node, timeout, step down)?
    ///
    /// Only connectivity errors are worth retrying.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::MongoError(e) => is_network_error(e),
            SyncError::Stage { source, .. } => source.is_connectivity(),
            _ => false,
        }
    }
}

/// Phase of one sync run, used to tell the user where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// connect and check source, destination.
    Startup,
    /// load the last applied timestamp.
    ReadCheckpoint,
    /// read, filter, rewrite and apply oplog entries.
    Stream,
    /// write the new checkpoint.
    PersistCheckpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Startup => "startup",
            Stage::ReadCheckpoint => "read checkpoint",
            Stage::Stream => "stream oplog",
            Stage::PersistCheckpoint => "persist checkpoint",
        };
        f.write_str(name)
    }
}

pub type Result<T> = StdResult<T, SyncError>;

/// Returns the server error code carried by `error`, if any.
pub(crate) fn server_error_code(error: &MongoError) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(err) => Some(err.code),
        ErrorKind::Write(WriteFailure::WriteError(err)) => Some(err.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(err)) => Some(err.code),
        _ => None,
    }
}

pub(crate) fn is_network_error(error: &MongoError) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => true,
        _ => server_error_code(error)
            .map(|code| NETWORK_ERROR_CODES.contains(&code))
            .unwrap_or(false),
    }
}
