//! Namespace, namespace pattern and the rule set built from them.
//!
//! A namespace is either `database.collection` or a bare `database`.  Collection names may
//! contain dots (`local.oplog.rs`, `db.system.indexes`), so only the first dot splits.

use std::fmt;

use crate::rename::RenameMap;
use crate::{Result, SyncError};

/// Suffix mongodb uses for the collection part of command oplog namespaces.
pub const COMMAND_COLL: &str = "$cmd";

/// A `database` or `database.collection` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: Option<String>,
}

impl Namespace {
    /// construct a collection namespace.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: Some(coll.into()),
        }
    }

    /// construct a whole-database namespace.
    pub fn database(db: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: None,
        }
    }

    /// Parse `db` or `db.coll`.
    ///
    /// # Example
    /// ```
    /// use mongo_oplog::Namespace;
    /// let ns = Namespace::parse("local.oplog.rs").unwrap();
    /// assert_eq!(ns.db(), "local");
    /// assert_eq!(ns.coll(), Some("oplog.rs"));
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        match value.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            Some(_) => Err(SyncError::InvalidNamespace(value.to_string())),
            None if !value.is_empty() => Ok(Namespace::database(value)),
            None => Err(SyncError::InvalidNamespace(value.to_string())),
        }
    }

    /// database name.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// collection name, None for a whole-database namespace.
    pub fn coll(&self) -> Option<&str> {
        self.coll.as_deref()
    }

    /// Is this the `<db>.$cmd` pseudo namespace of command oplogs?
    pub fn is_command(&self) -> bool {
        self.coll.as_deref() == Some(COMMAND_COLL)
    }

    /// the `<db>.$cmd` namespace for this namespace's database.
    pub fn command_ns(&self) -> Namespace {
        Namespace::new(self.db.clone(), COMMAND_COLL)
    }

    /// Same collection, moved to database `db`.
    pub fn with_db(&self, db: &str) -> Namespace {
        Namespace {
            db: db.to_string(),
            coll: self.coll.clone(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.coll {
            Some(coll) => write!(f, "{}.{}", self.db, coll),
            None => f.write_str(&self.db),
        }
    }
}

/// Namespace pattern used by include and exclude rules.
///
/// A bare database pattern matches everything in that database, a collection pattern matches
/// that exact collection only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsPattern(Namespace);

impl NsPattern {
    /// parse a pattern, accepted forms are `db` and `db.coll`.
    pub fn parse(value: &str) -> Result<Self> {
        Namespace::parse(value).map(NsPattern)
    }

    /// check if `ns` falls under this pattern.
    pub fn matches(&self, ns: &Namespace) -> bool {
        if self.0.db != ns.db {
            return false;
        }
        match self.0.coll() {
            None => true,
            Some(coll) => ns.coll() == Some(coll),
        }
    }

    /// the namespace this pattern is written as.
    pub fn namespace(&self) -> &Namespace {
        &self.0
    }
}

/// All namespace rules of one run.
#[derive(Debug, Clone, Default)]
pub struct NsRules {
    /// allow-list, when non-empty `exclude` is ignored.
    pub include: Vec<NsPattern>,
    /// deny-list.
    pub exclude: Vec<NsPattern>,
    /// renames applied to entries which pass the filter.
    pub rename: RenameMap,
}

impl NsRules {
    /// Build rules from raw pattern and rename strings.
    pub fn parse<S: AsRef<str>>(include: &[S], exclude: &[S], rename: &[S]) -> Result<Self> {
        let include = include
            .iter()
            .map(|p| NsPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let exclude = exclude
            .iter()
            .map(|p| NsPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let rename = RenameMap::parse(rename)?;
        Ok(NsRules {
            include,
            exclude,
            rename,
        })
    }

    /// Is every include pattern moved somewhere else by a rename rule?
    ///
    /// Replaying a deployment's oplog onto itself is only safe in this case.
    pub fn includes_fully_renamed(&self) -> bool {
        !self.include.is_empty()
            && self
                .include
                .iter()
                .all(|p| self.rename.resolve(p.namespace()).is_some())
    }
}
