//! mongo_oplog configuration, express in toml.
//!
//! Configuration file example:
//! ```toml
//! src_uri = "mongodb://localhost:27017/?replicaSet=rs0"
//! dst_uri = "mongodb://localhost:27018"
//!
//! exclude = ["test.skipped", "logs"]
//! rename = ["app=app_copy", "app.users=app_copy.people"]
//! follow = true
//!
//! [checkpoint]
//! type = "file"
//! path = "mongooplog.ts"
//! ```
//!
//! Only `src_uri` and `dst_uri` are required.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::namespace::{Namespace, NsRules};
use crate::retry::RetryPolicy;
use crate::syncer::RunOptions;
use crate::Result;

/// Where the checkpoint is stored.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointConf {
    /// one document per checkpoint key, in a collection of the destination.
    Mongo {
        /// database name.
        #[serde(default = "default_checkpoint_db")]
        db: String,
        /// collection name.
        #[serde(default = "default_checkpoint_coll")]
        coll: String,
    },
    /// a local json file.
    File {
        /// file path.
        path: PathBuf,
    },
}

impl Default for CheckpointConf {
    fn default() -> Self {
        CheckpointConf::Mongo {
            db: default_checkpoint_db(),
            coll: default_checkpoint_coll(),
        }
    }
}

/// Oplog sync configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct OplogSyncConf {
    /// source mongodb uri, it needs to be a replica set member.
    pub src_uri: String,
    /// destination mongodb uri.
    pub dst_uri: String,
    /// namespaces to replay, when given `exclude` is ignored.
    #[serde(default)]
    pub include: Vec<String>,
    /// namespaces to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// `old=new` rename rules.
    #[serde(default)]
    pub rename: Vec<String>,
    /// oplog namespace on the source.
    #[serde(default = "default_oplog_ns")]
    pub oplog_ns: String,
    /// without a checkpoint, start this many seconds back.
    #[serde(default)]
    pub start_seconds_ago: Option<u32>,
    /// keep tailing the oplog instead of stopping at its end.
    #[serde(default)]
    pub follow: bool,
    /// checkpoint storage.
    #[serde(default)]
    pub checkpoint: CheckpointConf,
    /// checkpoint identity, defaults to the source deployment identity.
    #[serde(default)]
    pub checkpoint_key: Option<String>,
    /// entries between two checkpoint saves.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// entries buffered between the reader and the applier.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// connect, server selection and await timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// retries for connectivity errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// first retry delay in milliseconds, doubled for each retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// fail the run on malformed entries instead of skipping them.
    #[serde(default)]
    pub halt_on_malformed: bool,
}

fn default_oplog_ns() -> String {
    format!("{}.{}", crate::OPLOG_DB, crate::OPLOG_COLL)
}

fn default_checkpoint_db() -> String {
    "mongo_oplog".to_string()
}

fn default_checkpoint_coll() -> String {
    "checkpoints".to_string()
}

fn default_checkpoint_interval() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    1024
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl OplogSyncConf {
    /// create configuration with default settings.
    pub fn new(src_uri: impl Into<String>, dst_uri: impl Into<String>) -> Self {
        OplogSyncConf {
            src_uri: src_uri.into(),
            dst_uri: dst_uri.into(),
            include: vec![],
            exclude: vec![],
            rename: vec![],
            oplog_ns: default_oplog_ns(),
            start_seconds_ago: None,
            follow: false,
            checkpoint: CheckpointConf::default(),
            checkpoint_key: None,
            checkpoint_interval: default_checkpoint_interval(),
            buffer_size: default_buffer_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            halt_on_malformed: false,
        }
    }

    /// parse configuration from toml content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// read configuration from toml file `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Validate and build namespace rules.
    pub fn rules(&self) -> Result<NsRules> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            warn!(include = ?self.include, exclude = ?self.exclude, "Include namespaces are given, exclude namespaces are ignored.");
        }
        NsRules::parse(&self.include, &self.exclude, &self.rename)
    }

    /// parsed oplog namespace.
    pub fn oplog_namespace(&self) -> Result<Namespace> {
        Namespace::parse(&self.oplog_ns)
    }

    /// per operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// retry policy for connectivity errors.
    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay = Duration::from_millis(self.retry_backoff_ms);
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay,
            max_delay: base_delay.max(self.timeout()),
        }
    }

    /// options of the syncer itself.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            start_seconds_ago: self.start_seconds_ago,
            checkpoint_interval: self.checkpoint_interval,
            buffer_size: self.buffer_size,
            halt_on_malformed: self.halt_on_malformed,
            retry: self.retry_policy(),
            ..RunOptions::default()
        }
    }
}
