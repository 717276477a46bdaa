//! In-memory source, destination and checkpoint, for exercising the syncer without a server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use bson::{doc, Bson, Document, Timestamp};

use crate::checkpoint::CheckpointStore;
use crate::cmd_oplog::CmdOplog;
use crate::oplog::{LogEntry, Operation, Parsed};
use crate::syncer::{ApplyOutcome, OplogApplier, OplogSource, OplogStream, StartAt};
use crate::{Result, SyncError};

const BASE_TIME: u32 = 1_600_000_000;

/// Source oplog kept in a vector, every write gets the next timestamp.
#[derive(Default)]
pub struct MemorySource {
    oplog: Mutex<Vec<Document>>,
    clock: AtomicU32,
}

impl MemorySource {
    /// append `raw` with a fresh `ts`.
    pub fn push_raw(&self, mut raw: Document) {
        let increment = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        raw.insert(
            "ts",
            Timestamp {
                time: BASE_TIME,
                increment,
            },
        );
        self.oplog.lock().unwrap().push(raw);
    }

    pub fn insert(&self, ns: &str, document: Document) {
        self.push_raw(doc! {"op": "i", "ns": ns, "o": document});
    }

    pub fn update(&self, ns: &str, criteria: Document, modifier: Document) {
        self.push_raw(doc! {"op": "u", "ns": ns, "o2": criteria, "o": modifier});
    }

    pub fn delete(&self, ns: &str, criteria: Document) {
        self.push_raw(doc! {"op": "d", "ns": ns, "o": criteria});
    }

    pub fn create_index(&self, ns: &str, name: &str) {
        let (db, coll) = ns.split_once('.').unwrap();
        self.push_raw(doc! {
            "op": "c",
            "ns": format!("{}.$cmd", db),
            "o": {"createIndexes": coll, "v": 2, "key": {name: 1}, "name": name},
        });
    }

    pub fn rename_collection(&self, from: &str, to: &str) {
        let (db, _) = from.split_once('.').unwrap();
        self.push_raw(doc! {
            "op": "c",
            "ns": format!("{}.$cmd", db),
            "o": {"renameCollection": from, "to": to, "dropTarget": false},
        });
    }

    pub fn legacy_index(&self, ns: &str, name: &str) {
        let (db, _) = ns.split_once('.').unwrap();
        self.push_raw(doc! {
            "op": "i",
            "ns": format!("{}.system.indexes", db),
            "o": {"v": 1, "key": {name: 1}, "name": name, "ns": ns},
        });
    }

    pub fn noop(&self) {
        self.push_raw(doc! {"op": "n", "ns": "", "o": {"msg": "periodic noop"}});
    }

    pub fn transaction(&self, ops: Vec<Document>) {
        let ops: Vec<Bson> = ops.into_iter().map(Bson::Document).collect();
        self.push_raw(doc! {"op": "c", "ns": "admin.$cmd", "o": {"applyOps": ops}});
    }

    pub fn latest_ts(&self) -> Option<Timestamp> {
        self.oplog
            .lock()
            .unwrap()
            .last()
            .and_then(|raw| raw.get_timestamp("ts").ok())
    }

    /// drop entries older than `ts`, as a capped oplog does.
    pub fn truncate_before(&self, ts: Timestamp) {
        self.oplog
            .lock()
            .unwrap()
            .retain(|raw| raw.get_timestamp("ts").map(|t| t >= ts).unwrap_or(false));
    }
}

impl OplogSource for MemorySource {
    fn earliest_ts(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .oplog
            .lock()
            .unwrap()
            .first()
            .and_then(|raw| raw.get_timestamp("ts").ok()))
    }

    fn read_from(&self, start: StartAt) -> Result<OplogStream> {
        let entries: Vec<Result<Parsed>> = self
            .oplog
            .lock()
            .unwrap()
            .iter()
            .filter(|raw| {
                let ts = raw.get_timestamp("ts").unwrap();
                match start {
                    StartAt::After(after) => ts > after,
                    StartAt::From(from) => ts >= from,
                    StartAt::Beginning => true,
                }
            })
            .map(|raw| Ok(Parsed::from_doc(raw)))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }
}

/// Destination with just enough of mongodb semantics to check replay results.
#[derive(Default)]
pub struct MemoryDestination {
    collections: Mutex<BTreeMap<String, Vec<Document>>>,
    indexes: Mutex<BTreeMap<String, BTreeSet<String>>>,
    writes: AtomicUsize,
    fail_at: Mutex<Option<Timestamp>>,
}

impl MemoryDestination {
    pub fn find(&self, ns: &str) -> Vec<Document> {
        self.collections
            .lock()
            .unwrap()
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub fn indexes(&self, ns: &str) -> Vec<String> {
        self.indexes
            .lock()
            .unwrap()
            .get(ns)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.collections.lock().unwrap().keys().cloned().collect()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// make the entry at `ts` fail.
    pub fn fail_at(&self, ts: Timestamp) {
        *self.fail_at.lock().unwrap() = Some(ts);
    }

    fn apply_command(&self, cmd: &CmdOplog) -> ApplyOutcome {
        let mut collections = self.collections.lock().unwrap();
        let mut indexes = self.indexes.lock().unwrap();
        match cmd {
            CmdOplog::CreateIndexes { ns, indexes: specs } => {
                let names = indexes.entry(ns.to_string()).or_default();
                let mut added = false;
                for spec in specs {
                    added |= names.insert(spec.get_str("name").unwrap().to_string());
                }
                changed(added)
            }
            CmdOplog::CreateCollection { ns, .. } => {
                let ns = ns.to_string();
                changed(collections.insert(ns.clone(), Vec::new()).is_none())
            }
            CmdOplog::DropCollection(ns) => {
                indexes.remove(&ns.to_string());
                changed(collections.remove(&ns.to_string()).is_some())
            }
            CmdOplog::RenameCollection { from, to, .. } => {
                match collections.remove(&from.to_string()) {
                    Some(docs) => {
                        collections.insert(to.to_string(), docs);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::NoOp,
                }
            }
            CmdOplog::DropDatabase(ns) => {
                let prefix = format!("{}.", ns.db());
                let before = collections.len();
                collections.retain(|name, _| !name.starts_with(&prefix));
                indexes.retain(|name, _| !name.starts_with(&prefix));
                changed(collections.len() != before)
            }
            _ => ApplyOutcome::Applied,
        }
    }
}

fn changed(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::NoOp
    }
}

fn matches(document: &Document, criteria: &Document) -> bool {
    criteria.iter().all(|(k, v)| document.get(k) == Some(v))
}

fn modify(document: &Document, modifier: &Document) -> Document {
    if modifier.keys().any(|k| k.starts_with('$')) {
        let mut updated = document.clone();
        if let Ok(set) = modifier.get_document("$set") {
            for (k, v) in set {
                updated.insert(k.clone(), v.clone());
            }
        }
        if let Ok(unset) = modifier.get_document("$unset") {
            for k in unset.keys() {
                updated.remove(k);
            }
        }
        updated
    } else {
        let mut replaced = Document::new();
        if let Some(id) = document.get("_id") {
            replaced.insert("_id", id.clone());
        }
        for (k, v) in modifier {
            if k != "_id" {
                replaced.insert(k.clone(), v.clone());
            }
        }
        replaced
    }
}

impl OplogApplier for MemoryDestination {
    fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        if *self.fail_at.lock().unwrap() == Some(entry.ts) {
            return Err(SyncError::ApplyOplogError(doc! {"ok": 0, "errmsg": "injected failure"}));
        }

        let outcome = match &entry.op {
            Operation::Command(cmd) => self.apply_command(cmd),
            Operation::Insert { document } => {
                let mut collections = self.collections.lock().unwrap();
                let docs = collections.entry(entry.ns.to_string()).or_default();
                if docs.iter().any(|d| d.get("_id") == document.get("_id")) {
                    ApplyOutcome::NoOp
                } else {
                    docs.push(document.clone());
                    ApplyOutcome::Applied
                }
            }
            Operation::Update {
                criteria,
                modifier,
                upsert,
            } => {
                let mut collections = self.collections.lock().unwrap();
                let docs = collections.entry(entry.ns.to_string()).or_default();
                match docs.iter_mut().find(|d| matches(d, criteria)) {
                    Some(current) => {
                        let updated = modify(current, modifier);
                        let outcome = changed(updated != *current);
                        *current = updated;
                        outcome
                    }
                    None if *upsert => {
                        docs.push(modify(criteria, modifier));
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::NoOp,
                }
            }
            Operation::Delete { criteria } => {
                let mut collections = self.collections.lock().unwrap();
                let docs = collections.entry(entry.ns.to_string()).or_default();
                match docs.iter().position(|d| matches(d, criteria)) {
                    Some(pos) => {
                        docs.remove(pos);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::NoOp,
                }
            }
        };
        if outcome == ApplyOutcome::Applied {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

/// Checkpoint in memory, saves can be made to fail.
#[derive(Default)]
pub struct MemoryCheckpoint {
    ts: Mutex<Option<Timestamp>>,
    fail: AtomicBool,
}

impl MemoryCheckpoint {
    pub fn get(&self) -> Option<Timestamp> {
        *self.ts.lock().unwrap()
    }

    pub fn reset(&self, ts: Option<Timestamp>) {
        *self.ts.lock().unwrap() = ts;
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> Result<Option<Timestamp>> {
        Ok(self.get())
    }

    fn save(&self, ts: Timestamp) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "checkpoint storage is read only",
            )));
        }
        self.reset(Some(ts));
        Ok(())
    }
}
