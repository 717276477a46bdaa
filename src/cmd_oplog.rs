//! Provide structured command type oplog definition.
//!
//! Every command subtype lists the namespaces it refers to, see [CmdOplog::namespaces_mut].
//! This is what lets a rename rule follow an index build or a collection rename onto the
//! renamed collection.

use bson::{doc, Bson, Document};
use mongodb::error::Result as MongoResult;
use mongodb::sync::Client as MongoClient;
use tracing::debug;

use crate::error::server_error_code;
use crate::namespace::Namespace;
use crate::syncer::ApplyOutcome;
use crate::{Result, SyncError, ADMIN_DB_NAME};

/// NamespaceNotFound.
const NAMESPACE_NOT_FOUND: i32 = 26;
/// IndexNotFound.
const INDEX_NOT_FOUND: i32 = 27;
/// NamespaceExists.
const NAMESPACE_EXISTS: i32 = 48;

/// Structured command type oplog definition.
///
/// Basically, use [CmdOplog::from_oplog] to parse the `o` document of a command oplog and
/// create this item, and then use [apply](CmdOplog::apply) method to apply it against a
/// mongodb client.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdOplog {
    /// create collection command.
    CreateCollection {
        /// collection to create.
        ns: Namespace,
        /// source collection when the command creates a view, in the same database as `ns`.
        view_on: Option<Namespace>,
        /// extra create options, like `capped` or `validator`.
        options: Document,
    },
    /// drop collection command.
    DropCollection(Namespace),
    /// rename collection command.
    RenameCollection {
        /// rename namespace from.
        from: Namespace,
        /// rename namespace to.
        to: Namespace,
        /// drop `to` first if it exists.
        drop_target: bool,
    },
    /// create indexes command, also produced by `commitIndexBuild` and legacy
    /// `system.indexes` inserts.
    CreateIndexes {
        /// relative namespace to create index.
        ns: Namespace,
        /// index specifications, each one contains at least `key` and `name`.
        indexes: Vec<Document>,
    },
    /// drop indexes command.
    DropIndexes {
        /// relative namespace to drop index.
        ns: Namespace,
        /// index name, key pattern or `"*"`.
        index: Bson,
    },
    /// collMod command.
    CollMod {
        /// collection to modify.
        ns: Namespace,
        /// modifications.
        options: Document,
    },
    /// drop database command.
    DropDatabase(Namespace),
    /// bookkeeping commands which need no action on destination, like `startIndexBuild`.
    Ignored {
        /// namespace the command refers to.
        ns: Namespace,
        /// command name.
        name: String,
    },
}

impl CmdOplog {
    /// Parse a command oplog's `o` document, `db` is the database part of the oplog namespace.
    ///
    /// It returns None when the command in `obj` can't be recognized.
    ///
    /// # Example
    /// ```
    /// use mongo_oplog::cmd_oplog::CmdOplog;
    /// use mongo_oplog::Namespace;
    /// use bson::doc;
    /// let obj = doc! {"renameCollection": "a.b", "to": "a.c"};
    /// let oplog = CmdOplog::from_oplog("a", &obj).unwrap().unwrap();
    /// assert_eq!(
    ///     oplog,
    ///     CmdOplog::RenameCollection {
    ///         from: Namespace::new("a", "b"),
    ///         to: Namespace::new("a", "c"),
    ///         drop_target: false,
    ///     }
    /// );
    /// ```
    pub fn from_oplog(db: &str, obj: &Document) -> Result<Option<Self>> {
        let name = match obj.keys().next() {
            Some(name) => name.as_str(),
            None => return Err(SyncError::MalformedEntry("empty command document".to_string())),
        };

        let cmd = match name {
            // { "create": "coll", "capped": true, "size": 100, "idIndex": {...} }
            // { "create": "view", "viewOn": "coll", "pipeline": [...] }
            "create" => {
                let coll = obj.get_str("create")?;
                let view_on = match obj.get("viewOn") {
                    Some(Bson::String(source)) => Some(Namespace::new(db, source.as_str())),
                    Some(other) => {
                        return Err(SyncError::MalformedEntry(format!(
                            "viewOn should be a collection name, get {:?}",
                            other
                        )))
                    }
                    None => None,
                };
                let mut options = obj.clone();
                options.remove("create");
                options.remove("viewOn");
                // idIndex is rebuilt by the destination, and old servers put the source
                // namespace inside of it.
                options.remove("idIndex");
                CmdOplog::CreateCollection {
                    ns: Namespace::new(db, coll),
                    view_on,
                    options,
                }
            }
            // { "drop": "coll" }
            "drop" => CmdOplog::DropCollection(Namespace::new(db, obj.get_str("drop")?)),
            // { "renameCollection": "db.from", "to": "db.to", "dropTarget": false }
            // "dropTarget" is the uuid of the dropped collection on newer servers.
            "renameCollection" => {
                let from = Namespace::parse(obj.get_str("renameCollection")?)?;
                let to = Namespace::parse(obj.get_str("to")?)?;
                if from.coll().is_none() || to.coll().is_none() {
                    return Err(SyncError::MalformedEntry(format!(
                        "renameCollection needs two collection namespaces, get {:?}",
                        obj
                    )));
                }
                let drop_target = match obj.get("dropTarget") {
                    Some(Bson::Boolean(b)) => *b,
                    Some(Bson::Binary(_)) => true,
                    _ => false,
                };
                CmdOplog::RenameCollection {
                    from,
                    to,
                    drop_target,
                }
            }
            // { "createIndexes": "coll", "v": 2, "key": {"x": 1}, "name": "x_1", "unique": true }
            "createIndexes" => {
                let coll = obj.get_str("createIndexes")?;
                let mut spec = obj.clone();
                spec.remove("createIndexes");
                CmdOplog::CreateIndexes {
                    ns: Namespace::new(db, coll),
                    indexes: vec![index_spec(spec)?],
                }
            }
            // { "commitIndexBuild": "coll", "indexBuildUUID": UUID, "indexes": [{...}] }
            "commitIndexBuild" => {
                let coll = obj.get_str("commitIndexBuild")?;
                let indexes = obj
                    .get_array("indexes")?
                    .iter()
                    .map(|index| match index {
                        Bson::Document(spec) => index_spec(spec.clone()),
                        other => Err(SyncError::MalformedEntry(format!(
                            "index specification should be a document, get {:?}",
                            other
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                CmdOplog::CreateIndexes {
                    ns: Namespace::new(db, coll),
                    indexes,
                }
            }
            // { "dropIndexes": "coll", "index": "index_name" }
            "dropIndexes" | "deleteIndexes" => {
                let coll = obj.get_str(name)?;
                let index = obj
                    .get("index")
                    .cloned()
                    .ok_or_else(|| SyncError::MalformedEntry(format!("{} without `index`", name)))?;
                CmdOplog::DropIndexes {
                    ns: Namespace::new(db, coll),
                    index,
                }
            }
            // { "collMod": "coll", "validator": {...} }
            "collMod" => {
                let coll = obj.get_str("collMod")?;
                let mut options = obj.clone();
                options.remove("collMod");
                CmdOplog::CollMod {
                    ns: Namespace::new(db, coll),
                    options,
                }
            }
            // { "dropDatabase": 1 }
            "dropDatabase" => CmdOplog::DropDatabase(Namespace::database(db)),
            // two phase index build bookkeeping, only `commitIndexBuild` matters.
            "startIndexBuild" | "abortIndexBuild" => CmdOplog::Ignored {
                ns: Namespace::new(db, obj.get_str(name)?),
                name: name.to_string(),
            },
            _ => {
                debug!(?obj, "Get a command which can't be handled.");
                return Ok(None);
            }
        };
        Ok(Some(cmd))
    }

    /// Parse an insert into legacy `<db>.system.indexes`, which builds the index described by
    /// `obj` on the collection named by its `ns` field.
    pub fn from_legacy_index(obj: &Document) -> Result<Self> {
        let ns = Namespace::parse(obj.get_str("ns")?)?;
        if ns.coll().is_none() {
            return Err(SyncError::InvalidNamespace(ns.to_string()));
        }
        Ok(CmdOplog::CreateIndexes {
            ns,
            indexes: vec![index_spec(obj.clone())?],
        })
    }

    /// command name, used for logging.
    pub fn name(&self) -> &str {
        use CmdOplog::*;
        match self {
            CreateCollection { .. } => "create",
            DropCollection(_) => "drop",
            RenameCollection { .. } => "renameCollection",
            CreateIndexes { .. } => "createIndexes",
            DropIndexes { .. } => "dropIndexes",
            CollMod { .. } => "collMod",
            DropDatabase(_) => "dropDatabase",
            Ignored { name, .. } => name,
        }
    }

    /// The namespace this command mainly works on, filter rules are checked against it.
    pub fn primary_ns(&self) -> &Namespace {
        use CmdOplog::*;
        match self {
            CreateCollection { ns, .. }
            | CreateIndexes { ns, .. }
            | DropIndexes { ns, .. }
            | CollMod { ns, .. }
            | Ignored { ns, .. } => ns,
            DropCollection(ns) | DropDatabase(ns) => ns,
            RenameCollection { from, .. } => from,
        }
    }

    /// Every namespace-valued field of this command.
    pub fn namespaces_mut(&mut self) -> Vec<&mut Namespace> {
        use CmdOplog::*;
        match self {
            CreateCollection { ns, view_on, .. } => {
                let mut namespaces = vec![ns];
                namespaces.extend(view_on.as_mut());
                namespaces
            }
            CreateIndexes { ns, .. }
            | DropIndexes { ns, .. }
            | CollMod { ns, .. }
            | Ignored { ns, .. } => vec![ns],
            DropCollection(ns) | DropDatabase(ns) => vec![ns],
            RenameCollection { from, to, .. } => vec![from, to],
        }
    }

    /// Apply oplog represent in `self` against `mongo_conn`.
    ///
    /// Commands whose effect is already there (collection exists, index already dropped...)
    /// return [ApplyOutcome::NoOp].
    ///
    /// # Example
    /// ```no_run
    /// use mongodb::sync::Client;
    /// use mongo_oplog::cmd_oplog::CmdOplog;
    /// use mongo_oplog::Namespace;
    /// let cli = Client::with_uri_str("mongodb://localhost:27017").unwrap();
    /// let cmd_oplog = CmdOplog::DropCollection(Namespace::new("syncer_test", "b"));
    /// cmd_oplog.apply(&cli).unwrap();
    /// ```
    pub fn apply(&self, mongo_conn: &MongoClient) -> Result<ApplyOutcome> {
        use CmdOplog::*;
        match self {
            CreateCollection { ns, view_on, options } => {
                let mut cmd = doc! {"create": coll_name(ns)?};
                if let Some(view_on) = view_on {
                    if view_on.db() != ns.db() {
                        return Err(SyncError::InvalidRename {
                            rule: format!("view {} on {}", ns, view_on),
                            reason: "a view must stay in the database of its source collection",
                        });
                    }
                    cmd.insert("viewOn", coll_name(view_on)?);
                }
                append(&mut cmd, options);
                let result = mongo_conn.database(ns.db()).run_command(cmd, None);
                outcome(result, &[NAMESPACE_EXISTS])
            }
            DropCollection(ns) => {
                let result = mongo_conn
                    .database(ns.db())
                    .run_command(doc! {"drop": coll_name(ns)?}, None);
                outcome(result, &[NAMESPACE_NOT_FOUND])
            }
            RenameCollection {
                from,
                to,
                drop_target,
            } => {
                // rename collection can only runs in admin database.
                let result = mongo_conn.database(ADMIN_DB_NAME).run_command(
                    doc! {
                        "renameCollection": from.to_string(),
                        "to": to.to_string(),
                        "dropTarget": drop_target,
                    },
                    None,
                );
                outcome(result, &[NAMESPACE_NOT_FOUND, NAMESPACE_EXISTS])
            }
            CreateIndexes { ns, indexes } => {
                let reply = mongo_conn.database(ns.db()).run_command(
                    doc! {
                        "createIndexes": coll_name(ns)?,
                        "indexes": indexes.clone(),
                    },
                    None,
                )?;
                let before = reply.get_i32("numIndexesBefore").ok();
                let after = reply.get_i32("numIndexesAfter").ok();
                if before.is_some() && before == after {
                    Ok(ApplyOutcome::NoOp)
                } else {
                    Ok(ApplyOutcome::Applied)
                }
            }
            DropIndexes { ns, index } => {
                let result = mongo_conn.database(ns.db()).run_command(
                    doc! {
                        "dropIndexes": coll_name(ns)?,
                        "index": index.clone(),
                    },
                    None,
                );
                outcome(result, &[NAMESPACE_NOT_FOUND, INDEX_NOT_FOUND])
            }
            CollMod { ns, options } => {
                let mut cmd = doc! {"collMod": coll_name(ns)?};
                append(&mut cmd, options);
                let result = mongo_conn.database(ns.db()).run_command(cmd, None);
                outcome(result, &[NAMESPACE_NOT_FOUND])
            }
            DropDatabase(ns) => {
                mongo_conn.database(ns.db()).drop(None)?;
                Ok(ApplyOutcome::Applied)
            }
            Ignored { .. } => Ok(ApplyOutcome::NoOp),
        }
    }
}

/// Strip the namespace from an index specification, the target collection is carried by
/// the command itself.
fn index_spec(mut spec: Document) -> Result<Document> {
    spec.remove("ns");
    if !spec.contains_key("key") || !spec.contains_key("name") {
        return Err(SyncError::MalformedEntry(format!(
            "index specification needs `key` and `name`, get {:?}",
            spec
        )));
    }
    Ok(spec)
}

fn append(cmd: &mut Document, options: &Document) {
    for (key, value) in options.iter() {
        cmd.insert(key.clone(), value.clone());
    }
}

fn coll_name(ns: &Namespace) -> Result<&str> {
    ns.coll()
        .ok_or_else(|| SyncError::InvalidNamespace(ns.to_string()))
}

/// Map a command result to an outcome, errors with one of `noop_codes` mean the command's
/// effect is already in place.
fn outcome<T>(result: MongoResult<T>, noop_codes: &[i32]) -> Result<ApplyOutcome> {
    match result {
        Ok(_) => Ok(ApplyOutcome::Applied),
        Err(e) => match server_error_code(&e) {
            Some(code) if noop_codes.contains(&code) => {
                debug!(code, "Command effect already exists on destination.");
                Ok(ApplyOutcome::NoOp)
            }
            _ => Err(SyncError::from(e)),
        },
    }
}
