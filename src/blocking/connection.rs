use std::time::Duration;

use bson::{doc, Document};
use mongodb::sync::{Client, Collection};
use tracing::info;

use crate::error::{Result, SyncError};
use crate::namespace::Namespace;
use crate::{OplogSyncConf, ADMIN_DB_NAME};

/// `msg` field of the hello reply when talking to a router.
const MONGOS_MSG: &str = "isdbgrid";

/// Source and destination clients of one sync.
#[derive(Clone)]
pub struct Connection {
    source_conn: Client,
    target_conn: Client,
    src_uri: String,
    dst_uri: String,
}

impl Connection {
    /// create a new connection from given `config`.
    pub fn new(config: &OplogSyncConf) -> Result<Connection> {
        let timeout = config.timeout();
        let source_conn = Client::with_uri_str(with_timeouts(&config.src_uri, timeout))?;
        let target_conn = Client::with_uri_str(with_timeouts(&config.dst_uri, timeout))?;
        Ok(Connection {
            source_conn,
            target_conn,
            src_uri: config.src_uri.clone(),
            dst_uri: config.dst_uri.clone(),
        })
    }

    /// Check if we have enough permissions to read `oplog_ns` and write `checkpoint_db`.
    pub fn check_permissions(&self, oplog_ns: &Namespace, checkpoint_db: Option<&str>) -> Result<()> {
        let source_db = self.source_conn.database(oplog_ns.db());
        match source_db.list_collection_names(None) {
            Err(e) => {
                return Err(SyncError::PermissionError {
                    uri: redact(&self.src_uri),
                    db: oplog_ns.db().to_string(),
                    detail: e,
                })
            }
            Ok(names) => {
                if !names.iter().any(|name| Some(name.as_str()) == oplog_ns.coll()) {
                    return Err(SyncError::MissingOplog(oplog_ns.to_string()));
                }
            }
        }

        let target_db_name = checkpoint_db.unwrap_or(ADMIN_DB_NAME);
        if let Err(e) = self.target_conn.database(target_db_name).list_collection_names(None) {
            return Err(SyncError::PermissionError {
                uri: redact(&self.dst_uri),
                db: target_db_name.to_string(),
                detail: e,
            });
        }
        Ok(())
    }

    /// Refuse a mongos destination, oplog entries carry shard local effects.
    pub fn check_destination(&self) -> Result<()> {
        let reply = hello(&self.target_conn)?;
        if matches!(reply.get_str("msg"), Ok(msg) if msg == MONGOS_MSG) {
            return Err(SyncError::DestinationIsMongos(redact(&self.dst_uri)));
        }
        Ok(())
    }

    /// Is the destination the very same deployment as the source?
    pub fn same_instance(&self) -> Result<bool> {
        Ok(self.source_identity()? == identity(&self.target_conn, &self.dst_uri)?)
    }

    /// Identity of the source deployment: replica set name and members, or the uri hosts.
    pub fn source_identity(&self) -> Result<String> {
        identity(&self.source_conn, &self.src_uri)
    }

    /// get source mongodb client.
    pub fn get_source_client(&self) -> Client {
        self.source_conn.clone()
    }

    /// get target mongodb client.
    pub fn get_target_client(&self) -> Client {
        self.target_conn.clone()
    }

    /// return the oplog collection.
    pub fn oplog_coll(&self, oplog_ns: &Namespace) -> Collection<Document> {
        self.source_conn
            .database(oplog_ns.db())
            .collection(oplog_ns.coll().unwrap_or_default())
    }
}

fn hello(client: &Client) -> Result<Document> {
    Ok(client
        .database(ADMIN_DB_NAME)
        .run_command(doc! {"isMaster": 1}, None)?)
}

fn identity(client: &Client, uri: &str) -> Result<String> {
    let reply = hello(client)?;
    let mut hosts: Vec<String> = reply
        .get_array("hosts")
        .map(|hosts| {
            hosts
                .iter()
                .filter_map(|h| h.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if hosts.is_empty() {
        hosts = uri_hosts(uri);
    }
    hosts.sort();

    let identity = match reply.get_str("setName") {
        Ok(set_name) => format!("{}/{}", set_name, hosts.join(",")),
        Err(_) => hosts.join(","),
    };
    info!(%identity, "Get deployment identity.");
    Ok(identity)
}

/// host list of a connection string, without scheme, credentials, database and options.
pub(crate) fn uri_hosts(uri: &str) -> Vec<String> {
    let rest = uri
        .strip_prefix("mongodb+srv://")
        .or_else(|| uri.strip_prefix("mongodb://"))
        .unwrap_or(uri);
    let hosts = rest.split(|c| c == '/' || c == '?').next().unwrap_or_default();
    let hosts = hosts.rsplit_once('@').map(|(_, h)| h).unwrap_or(hosts);
    hosts
        .split(',')
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// uri for logs and errors, credentials dropped.
fn redact(uri: &str) -> String {
    uri_hosts(uri).join(",")
}

/// Append driver timeouts to `uri`, unless the uri sets them itself.
pub(crate) fn with_timeouts(uri: &str, timeout: Duration) -> String {
    let millis = timeout.as_millis();
    let mut options = vec![];
    for key in ["connectTimeoutMS", "serverSelectionTimeoutMS"] {
        if !uri.contains(key) {
            options.push(format!("{}={}", key, millis));
        }
    }
    if options.is_empty() {
        return uri.to_string();
    }

    let scheme_end = uri.find("://").map(|i| i + 3).unwrap_or(0);
    let separator = if uri.contains('?') {
        if uri.ends_with('?') || uri.ends_with('&') {
            ""
        } else {
            "&"
        }
    } else if uri[scheme_end..].contains('/') {
        "?"
    } else {
        "/?"
    };
    format!("{}{}{}", uri, separator, options.join("&"))
}
