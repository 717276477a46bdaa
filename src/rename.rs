//! Namespace renaming.
//!
//! Rules come as `old=new`, either both sides are databases (`dbA=dbC`) or both sides are
//! collections (`dbA.coll1=dbA.coll2`).  A collection rule wins over a database rule which
//! covers the same collection.

use std::collections::HashMap;

use tracing::debug;

use crate::namespace::Namespace;
use crate::oplog::{LogEntry, Operation};
use crate::{Result, SyncError};

/// Rename rules, checked collection level first, then database level.
#[derive(Debug, Clone, Default)]
pub struct RenameMap {
    collections: HashMap<Namespace, Namespace>,
    databases: HashMap<String, String>,
}

impl RenameMap {
    /// Parse rename rules, later rules override earlier ones for the same source.
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut map = RenameMap::default();
        for rule in rules {
            map.add_rule(rule.as_ref())?;
        }
        Ok(map)
    }

    /// Add one `old=new` rule.
    pub fn add_rule(&mut self, rule: &str) -> Result<()> {
        let invalid = |reason| SyncError::InvalidRename {
            rule: rule.to_string(),
            reason,
        };
        let (old, new) = rule
            .split_once('=')
            .ok_or_else(|| invalid("expected `old=new`"))?;
        let old = Namespace::parse(old.trim()).map_err(|_| invalid("invalid source namespace"))?;
        let new = Namespace::parse(new.trim()).map_err(|_| invalid("invalid target namespace"))?;

        match (old.coll(), new.coll()) {
            (None, None) => {
                self.databases
                    .insert(old.db().to_string(), new.db().to_string());
            }
            (Some(_), Some(_)) => {
                self.collections.insert(old, new);
            }
            _ => return Err(invalid("both sides must be databases or both collections")),
        }
        Ok(())
    }

    /// Is there any rule?
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.databases.is_empty()
    }

    /// Returns where `ns` should go, None when no rule covers it.
    ///
    /// # Example
    /// ```
    /// use mongo_oplog::{Namespace, RenameMap};
    /// let map = RenameMap::parse(&["a=b", "a.x=c.y"]).unwrap();
    /// assert_eq!(map.resolve(&Namespace::new("a", "x")), Some(Namespace::new("c", "y")));
    /// assert_eq!(map.resolve(&Namespace::new("a", "z")), Some(Namespace::new("b", "z")));
    /// assert_eq!(map.resolve(&Namespace::new("d", "z")), None);
    /// ```
    pub fn resolve(&self, ns: &Namespace) -> Option<Namespace> {
        if let Some(new) = self.collections.get(ns) {
            return Some(new.clone());
        }
        self.databases.get(ns.db()).map(|db| ns.with_db(db))
    }
}

/// Rewrite every namespace of `entry` according to `rename`.
///
/// Only namespaces change: kind, timestamp and the rest of the payload stay untouched.
pub fn rewrite(mut entry: LogEntry, rename: &RenameMap) -> LogEntry {
    if rename.is_empty() {
        return entry;
    }

    match &mut entry.op {
        Operation::Command(cmd) => {
            let mut renamed = false;
            for ns in cmd.namespaces_mut() {
                if let Some(new_ns) = rename.resolve(ns) {
                    debug!(from = %ns, to = %new_ns, "Rename command namespace.");
                    *ns = new_ns;
                    renamed = true;
                }
            }
            if renamed {
                entry.ns = cmd.primary_ns().command_ns();
            }
        }
        _ => {
            if let Some(new_ns) = rename.resolve(&entry.ns) {
                debug!(from = %entry.ns, to = %new_ns, "Rename namespace.");
                entry.ns = new_ns;
            }
        }
    }
    entry
}
