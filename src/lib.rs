//! Mongo oplog lib, which replays the oplog of one mongodb deployment onto another one.
//!
//! One run reads source oplog entries after the saved checkpoint, drops entries by namespace,
//! renames namespaces (including the ones nested inside of command payloads), applies them
//! idempotently to the destination, and moves the checkpoint forward.
//!
//! The pipeline stages are plain functions ([decide], [rewrite]) and traits ([OplogSource],
//! [OplogApplier], [CheckpointStore]), [OplogSyncer] drives them.  The mongodb backed
//! implementations live in [blocking].
//!
//! # Example:
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use mongo_oplog::{blocking, OplogSyncConf};
//!
//! let mut conf = OplogSyncConf::new("mongodb://localhost:27017", "mongodb://localhost:27018");
//! conf.exclude = vec!["test.skipped".to_string()];
//! let summary = blocking::sync_once(&conf, Arc::new(AtomicBool::new(false))).unwrap();
//! println!("{:?}", summary);
//! ```

#![warn(missing_docs)]

pub mod blocking;
pub mod checkpoint;
pub mod cmd_oplog;
mod config;
mod error;
pub mod filter;
pub mod namespace;
pub mod oplog;
pub mod rename;
pub mod retry;
pub mod syncer;
pub mod time_helper;

#[cfg(test)]
mod testing;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// oplog operation object key name.
const OBJ_KEY: &str = "o";
/// oplog update criteria key name.
const OBJ2_KEY: &str = "o2";
/// oplog upsert flag key name.
const UPSERT_KEY: &str = "b";
/// noop operation.
const NOOP_OP: &str = "n";
/// command operation.
const COMMAND_OP: &str = "c";
/// insert operation.
const INSERT_OP: &str = "i";
/// update operation.
const UPDATE_OP: &str = "u";
/// delete operation.
const DELETE_OP: &str = "d";

pub use checkpoint::{CheckpointStore, FileCheckpoint};
pub use config::{CheckpointConf, OplogSyncConf};
pub use error::{Result, Stage, SyncError};
pub use filter::{decide, source_drop, Decision};
pub use namespace::{Namespace, NsPattern, NsRules};
pub use oplog::{LogEntry, Operation, Parsed};
pub use rename::{rewrite, RenameMap};
pub use retry::RetryPolicy;
pub use syncer::{
    ApplyOutcome, OplogApplier, OplogSource, OplogSyncer, RunOptions, RunSummary, StartAt,
};
