//! provide mongodb backed blocking implementations, and the glue to run a sync with them.
mod applier;
mod checkpoint;
mod connection;
mod oplog_helper;
mod reader;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;

pub use applier::MongoApplier;
pub use checkpoint::MongoCheckpointStore;
pub use connection::Connection;
pub use reader::MongoOplogReader;

use crate::checkpoint::{CheckpointStore, FileCheckpoint};
use crate::syncer::{OplogSyncer, RunSummary};
use crate::{CheckpointConf, OplogSyncConf, Result, Stage, SyncError};

/// Run one sync described by `conf`, `stop` ends a follow run.
pub fn sync_once(conf: &OplogSyncConf, stop: Arc<AtomicBool>) -> Result<RunSummary> {
    let rules = conf.rules().map_err(|e| e.at(Stage::Startup))?;
    let oplog_ns = conf.oplog_namespace().map_err(|e| e.at(Stage::Startup))?;
    let retry = conf.retry_policy();

    let conn = Connection::new(conf).map_err(|e| e.at(Stage::Startup))?;
    let checkpoint_db = match &conf.checkpoint {
        CheckpointConf::Mongo { db, .. } => Some(db.as_str()),
        CheckpointConf::File { .. } => None,
    };
    retry
        .run("check permissions", || conn.check_permissions(&oplog_ns, checkpoint_db))
        .map_err(|e| e.at(Stage::Startup))?;
    retry
        .run("check destination", || conn.check_destination())
        .map_err(|e| e.at(Stage::Startup))?;
    let same_instance = retry
        .run("compare deployments", || conn.same_instance())
        .map_err(|e| e.at(Stage::Startup))?;
    if same_instance && !rules.includes_fully_renamed() {
        return Err(SyncError::SameInstance.at(Stage::Startup));
    }

    let checkpoint: Box<dyn CheckpointStore> = match &conf.checkpoint {
        CheckpointConf::Mongo { db, coll } => {
            let key = match &conf.checkpoint_key {
                Some(key) => key.clone(),
                None => retry
                    .run("read source identity", || conn.source_identity())
                    .map_err(|e| e.at(Stage::Startup))?,
            };
            info!(%db, %coll, %key, "Use checkpoint record in destination.");
            Box::new(MongoCheckpointStore::new(&conn.get_target_client(), db, coll, key))
        }
        CheckpointConf::File { path } => {
            info!(?path, "Use checkpoint file.");
            Box::new(FileCheckpoint::new(path))
        }
    };

    let reader = MongoOplogReader::new(conn.oplog_coll(&oplog_ns), conf.follow, retry, conf.timeout());
    let applier = MongoApplier::new(conn.get_target_client());
    OplogSyncer::new(reader, applier, checkpoint, rules, conf.run_options())
        .with_stop_flag(stop)
        .run()
}
