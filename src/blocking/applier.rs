//! Applies oplog entries to the destination, one at a time.

use bson::{doc, Bson, Document};
use mongodb::options::{ReplaceOptions, UpdateOptions};
use mongodb::results::UpdateResult;
use mongodb::sync::{Client as MongoClient, Collection};
use tracing::debug;

use crate::error::server_error_code;
use crate::namespace::Namespace;
use crate::oplog::{LogEntry, Operation};
use crate::syncer::{ApplyOutcome, OplogApplier};
use crate::{Result, SyncError, ADMIN_DB_NAME, NAMESPACE_KEY, OBJ2_KEY, OBJ_KEY, OP_KEY, UPDATE_OP, UPSERT_KEY};

const DUPLICATE_KEY: i32 = 11000;
/// internal version marker of update oplogs, the server rejects it in user updates.
const VERSION_KEY: &str = "$v";
/// version of the delta (`diff`) update format.
const DELTA_VERSION: i32 = 2;

/// Applier which writes to a mongodb deployment.
#[derive(Debug, Clone)]
pub struct MongoApplier {
    mongo_conn: MongoClient,
}

impl MongoApplier {
    /// create an applier writing through `mongo_conn`.
    pub fn new(mongo_conn: MongoClient) -> Self {
        MongoApplier { mongo_conn }
    }

    fn collection(&self, ns: &Namespace) -> Result<Collection<Document>> {
        let coll = ns
            .coll()
            .ok_or_else(|| SyncError::InvalidNamespace(ns.to_string()))?;
        Ok(self.mongo_conn.database(ns.db()).collection(coll))
    }

    fn insert(&self, ns: &Namespace, document: &Document) -> Result<ApplyOutcome> {
        match self.collection(ns)?.insert_one(document.clone(), None) {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(e) if server_error_code(&e) == Some(DUPLICATE_KEY) => Ok(ApplyOutcome::NoOp),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, ns: &Namespace, criteria: &Document, modifier: &Document, upsert: bool) -> Result<ApplyOutcome> {
        if is_delta(modifier) {
            return self.apply_delta(ns, criteria, modifier, upsert);
        }

        let coll = self.collection(ns)?;
        let result = if modifier.keys().any(|k| k.starts_with('$')) {
            let mut modifier = modifier.clone();
            modifier.remove(VERSION_KEY);
            coll.update_one(
                criteria.clone(),
                modifier,
                UpdateOptions::builder().upsert(upsert).build(),
            )?
        } else {
            coll.replace_one(
                criteria.clone(),
                modifier.clone(),
                ReplaceOptions::builder().upsert(upsert).build(),
            )?
        };
        Ok(update_outcome(&result))
    }

    /// Delta updates can only be understood by the server's own oplog application.
    ///
    /// `applyOps` doesn't report whether the document changed, so the document is read
    /// before and after.
    fn apply_delta(&self, ns: &Namespace, criteria: &Document, modifier: &Document, upsert: bool) -> Result<ApplyOutcome> {
        let coll = self.collection(ns)?;
        let before = coll.find_one(criteria.clone(), None)?;
        if before.is_none() && !upsert {
            return Ok(ApplyOutcome::NoOp);
        }

        let mut op = doc! {
            OP_KEY: UPDATE_OP,
            NAMESPACE_KEY: ns.to_string(),
            OBJ_KEY: modifier.clone(),
            OBJ2_KEY: criteria.clone(),
        };
        if upsert {
            op.insert(UPSERT_KEY, true);
        }
        let reply = self
            .mongo_conn
            .database(ADMIN_DB_NAME)
            .run_command(doc! {"applyOps": [op], "alwaysUpsert": false}, None)?;
        if let Some(Bson::Boolean(false)) = reply.get_array("results").ok().and_then(|r| r.first()) {
            return Err(SyncError::ApplyOplogError(reply));
        }

        let after = coll.find_one(criteria.clone(), None)?;
        if after == before {
            Ok(ApplyOutcome::NoOp)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    fn delete(&self, ns: &Namespace, criteria: &Document) -> Result<ApplyOutcome> {
        let result = self.collection(ns)?.delete_one(criteria.clone(), None)?;
        if result.deleted_count == 0 {
            Ok(ApplyOutcome::NoOp)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }
}

impl OplogApplier for MongoApplier {
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        let outcome = match &entry.op {
            Operation::Insert { document } => self.insert(&entry.ns, document),
            Operation::Update {
                criteria,
                modifier,
                upsert,
            } => self.update(&entry.ns, criteria, modifier, *upsert),
            Operation::Delete { criteria } => self.delete(&entry.ns, criteria),
            Operation::Command(cmd) => cmd.apply(&self.mongo_conn),
        }?;
        debug!(ts = ?entry.ts, ns = %entry.ns, kind = %entry.kind(), ?outcome, "Apply oplog.");
        Ok(outcome)
    }
}

fn is_delta(modifier: &Document) -> bool {
    match modifier.get(VERSION_KEY) {
        Some(Bson::Int32(v)) => *v == DELTA_VERSION,
        Some(Bson::Int64(v)) => *v == DELTA_VERSION as i64,
        _ => false,
    }
}

fn update_outcome(result: &UpdateResult) -> ApplyOutcome {
    if result.modified_count > 0 || result.upserted_id.is_some() {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::NoOp
    }
}
