//! Most oplog information comes from here:
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type. (enum Optype)
//! ns: The namespace on which to apply the operation. (String)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied, the update criteria. (Document)
//! b: Upsert flag of update operation on old servers. (bool)
//!
//! For `op` field, the definition of OpType:
//! "c": Command
//! "i": Insert
//! "u": Update
//! "d": Delete
//! "n": Noop

use std::fmt;

use bson::{Bson, Document, Timestamp};

use crate::cmd_oplog::CmdOplog;
use crate::namespace::Namespace;
use crate::{
    COMMAND_OP, DELETE_OP, INSERT_OP, NAMESPACE_KEY, NOOP_OP, OBJ2_KEY, OBJ_KEY, OP_KEY,
    TIMESTAMP_KEY, UPDATE_OP, UPSERT_KEY,
};

/// legacy index catalog collection, inserting into it builds an index.
const SYSTEM_INDEXES_COLL: &str = "system.indexes";
/// command which wraps the operations of a transaction.
const APPLY_OPS_CMD: &str = "applyOps";

/// The operation carried by one oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// insert `document`.
    Insert {
        /// document to insert.
        document: Document,
    },
    /// update documents matching `criteria` with `modifier`.
    Update {
        /// `o2` field, usually `{_id: ...}`.
        criteria: Document,
        /// `o` field, an update document, a full replacement or a delta.
        modifier: Document,
        /// insert when nothing matches.
        upsert: bool,
    },
    /// delete the document matching `criteria`.
    Delete {
        /// `o` field, usually `{_id: ...}`.
        criteria: Document,
    },
    /// administrative command.
    Command(CmdOplog),
}

/// Operation kind, `kind` of a [LogEntry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// represent by "i"
    Insert,
    /// represent by "u"
    Update,
    /// represent by "d"
    Delete,
    /// represent by "c"
    Command,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Command => "command",
        };
        f.write_str(name)
    }
}

/// One parsed oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// The time when the oplog entry was created, also the resume point.
    pub ts: Timestamp,
    /// The namespace on which to apply the operation.
    pub ns: Namespace,
    /// The operation applied.
    pub op: Operation,
}

impl LogEntry {
    /// operation kind.
    pub fn kind(&self) -> OpKind {
        match self.op {
            Operation::Insert { .. } => OpKind::Insert,
            Operation::Update { .. } => OpKind::Update,
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Command(_) => OpKind::Command,
        }
    }

    /// The namespace this entry really changes.
    ///
    /// Command oplogs live in `<db>.$cmd`, their target collection is inside the payload.
    pub fn target_ns(&self) -> &Namespace {
        match &self.op {
            Operation::Command(cmd) => cmd.primary_ns(),
            _ => &self.ns,
        }
    }
}

/// An entry that can't be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedEntry {
    /// timestamp, if even that can't be read the entry can't advance the checkpoint.
    pub ts: Option<Timestamp>,
    /// why the entry was rejected.
    pub reason: String,
}

/// Result of parsing one raw oplog document.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// a replayable entry.
    Entry(LogEntry),
    /// operations committed by one transaction, they share the timestamp `ts`.
    Transaction {
        /// commit timestamp.
        ts: Timestamp,
        /// operations, in commit order.
        entries: Vec<LogEntry>,
    },
    /// noop heartbeat, nothing to apply.
    Noop(Timestamp),
    /// an entry that can't be replayed.
    Malformed(MalformedEntry),
}

impl Parsed {
    /// Parse a raw oplog document.
    ///
    /// # Example
    /// ```
    /// use bson::{doc, Timestamp};
    /// use mongo_oplog::oplog::{OpKind, Parsed};
    /// let raw = doc! {"ts": Timestamp{time: 10, increment: 1}, "op": "i", "ns": "a.b", "o": {"_id": 1}};
    /// match Parsed::from_doc(&raw) {
    ///     Parsed::Entry(entry) => assert_eq!(entry.kind(), OpKind::Insert),
    ///     _ => unreachable!(),
    /// }
    /// ```
    pub fn from_doc(doc: &Document) -> Parsed {
        let ts = match doc.get_timestamp(TIMESTAMP_KEY) {
            Ok(ts) => ts,
            Err(e) => {
                return Parsed::Malformed(MalformedEntry {
                    ts: None,
                    reason: format!("can't read `{}`: {}", TIMESTAMP_KEY, e),
                })
            }
        };

        let parsed = parse_op(ts, doc).and_then(|raw| match raw {
            RawOp::Entry(entry) => Ok(Parsed::Entry(entry)),
            RawOp::Noop => Ok(Parsed::Noop(ts)),
            RawOp::Transaction(ops) => {
                parse_transaction(ts, ops).map(|entries| Parsed::Transaction { ts, entries })
            }
        });
        parsed.unwrap_or_else(|reason| {
            Parsed::Malformed(MalformedEntry {
                ts: Some(ts),
                reason,
            })
        })
    }

    /// timestamp of the parsed document, if it has one.
    pub fn ts(&self) -> Option<Timestamp> {
        match self {
            Parsed::Entry(entry) => Some(entry.ts),
            Parsed::Transaction { ts, .. } | Parsed::Noop(ts) => Some(*ts),
            Parsed::Malformed(m) => m.ts,
        }
    }
}

enum RawOp<'a> {
    Noop,
    Entry(LogEntry),
    /// `o.applyOps` of a transaction commit.
    Transaction(&'a [Bson]),
}

fn parse_op(ts: Timestamp, doc: &Document) -> Result<RawOp<'_>, String> {
    let op = doc
        .get_str(OP_KEY)
        .map_err(|e| format!("can't read `{}`: {}", OP_KEY, e))?;
    if op == NOOP_OP {
        return Ok(RawOp::Noop);
    }

    let ns = doc
        .get_str(NAMESPACE_KEY)
        .map_err(|e| format!("can't read `{}`: {}", NAMESPACE_KEY, e))?;
    let ns = Namespace::parse(ns).map_err(|e| e.to_string())?;
    let obj = doc
        .get_document(OBJ_KEY)
        .map_err(|e| format!("can't read `{}`: {}", OBJ_KEY, e))?;

    let operation = match op {
        INSERT_OP if ns.coll() == Some(SYSTEM_INDEXES_COLL) => {
            Operation::Command(CmdOplog::from_legacy_index(obj).map_err(|e| e.to_string())?)
        }
        INSERT_OP => Operation::Insert {
            document: obj.clone(),
        },
        UPDATE_OP => {
            let criteria = doc
                .get_document(OBJ2_KEY)
                .map_err(|e| format!("can't read `{}`: {}", OBJ2_KEY, e))?;
            Operation::Update {
                criteria: criteria.clone(),
                modifier: obj.clone(),
                upsert: doc.get_bool(UPSERT_KEY).unwrap_or(false),
            }
        }
        DELETE_OP => Operation::Delete {
            criteria: obj.clone(),
        },
        COMMAND_OP if obj.contains_key(APPLY_OPS_CMD) => {
            if obj.get_bool("partialTxn").unwrap_or(false) || obj.get_bool("prepare").unwrap_or(false) {
                return Err("transaction spread over several oplog entries is not supported".to_string());
            }
            let ops = obj
                .get_array(APPLY_OPS_CMD)
                .map_err(|e| format!("can't read `{}`: {}", APPLY_OPS_CMD, e))?;
            return Ok(RawOp::Transaction(ops));
        }
        COMMAND_OP => match CmdOplog::from_oplog(ns.db(), obj).map_err(|e| e.to_string())? {
            Some(cmd) => Operation::Command(cmd),
            None => {
                let name = obj.keys().next().cloned().unwrap_or_default();
                return Err(format!("unsupported command {:?}", name));
            }
        },
        other => return Err(format!("unknown operation type {:?}", other)),
    };

    Ok(RawOp::Entry(LogEntry {
        ts,
        ns,
        op: operation,
    }))
}

/// Operations inside of a transaction don't carry their own `ts`, they all take the commit
/// timestamp.  One bad operation rejects the whole transaction.
fn parse_transaction(ts: Timestamp, ops: &[Bson]) -> Result<Vec<LogEntry>, String> {
    let mut entries = Vec::with_capacity(ops.len());
    for op in ops {
        let doc = match op {
            Bson::Document(doc) => doc,
            other => return Err(format!("transaction operation should be a document, get {:?}", other)),
        };
        match parse_op(ts, doc)? {
            RawOp::Entry(entry) => entries.push(entry),
            RawOp::Noop => {}
            RawOp::Transaction(_) => return Err("nested applyOps is not supported".to_string()),
        }
    }
    Ok(entries)
}
