//! Include / exclude namespace filter.

use tracing::warn;

use crate::cmd_oplog::CmdOplog;
use crate::namespace::{Namespace, NsRules};
use crate::oplog::{LogEntry, Operation};

/// Databases which belong to the server itself, their entries are never replayed.
const INTERNAL_DBS: [&str; 3] = ["admin", "local", "config"];

/// filter decision for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// replay the entry.
    Keep,
    /// skip the entry.
    Drop,
    /// a collection rename whose target is filtered out: the data leaves the replayed
    /// namespaces, so only the drop of the source collection is replayed.
    /// See [source_drop].
    DropSource,
}

/// Decide whether `entry` should be replayed.
///
/// Entries are matched by their target namespace, so a command is matched by the collection
/// it works on rather than by `<db>.$cmd`.  When include patterns exist, exclude patterns are
/// not consulted at all.
///
/// A collection rename is checked on both ends.  It is kept when both pass, turned into
/// [Decision::DropSource] when only the source passes, and dropped otherwise.
pub fn decide(entry: &LogEntry, rules: &NsRules) -> Decision {
    if let Operation::Command(CmdOplog::RenameCollection { from, to, .. }) = &entry.op {
        return match (passes(from, rules), passes(to, rules)) {
            (true, true) => Decision::Keep,
            (true, false) => Decision::DropSource,
            (false, true) => {
                warn!(ts = ?entry.ts, %from, %to, "Rename into a replayed namespace from a skipped one, the renamed collection can't be replayed.");
                Decision::Drop
            }
            (false, false) => Decision::Drop,
        };
    }

    if passes(entry.target_ns(), rules) {
        Decision::Keep
    } else {
        Decision::Drop
    }
}

/// Turn a collection rename into the drop of its source collection, other entries are
/// returned as they are.
pub fn source_drop(entry: LogEntry) -> LogEntry {
    let op = match entry.op {
        Operation::Command(CmdOplog::RenameCollection { from, .. }) => {
            Operation::Command(CmdOplog::DropCollection(from))
        }
        op => op,
    };
    LogEntry { op, ..entry }
}

fn passes(ns: &Namespace, rules: &NsRules) -> bool {
    if INTERNAL_DBS.contains(&ns.db()) {
        false
    } else if !rules.include.is_empty() {
        rules.include.iter().any(|p| p.matches(ns))
    } else {
        !rules.exclude.iter().any(|p| p.matches(ns))
    }
}
