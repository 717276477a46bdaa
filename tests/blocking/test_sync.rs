use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bson::{doc, Document};
use mongodb::sync::Client;

use mongo_oplog::{blocking, CheckpointConf, OplogSyncConf, Stage};

const SOURCE_DB: &str = "oplog_sync_test";
const TARGET_DB: &str = "oplog_sync_test_copy";

struct Context {
    pub source: Client,
    pub target: Client,
    pub dir: tempfile::TempDir,
}

impl Context {
    pub fn new() -> Self {
        Context {
            source: Client::with_uri_str(super::source_uri()).unwrap(),
            target: Client::with_uri_str(super::target_uri()).unwrap(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn conf(&self) -> OplogSyncConf {
        let mut conf = OplogSyncConf::new(super::source_uri(), super::target_uri());
        conf.include = vec![SOURCE_DB.to_string()];
        conf.rename = vec![format!("{}={}", SOURCE_DB, TARGET_DB)];
        conf.start_seconds_ago = Some(60);
        conf.checkpoint = CheckpointConf::File {
            path: self.dir.path().join("mongooplog.ts"),
        };
        conf.timeout_secs = 5;
        conf
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.source.database(SOURCE_DB).drop(None).unwrap();
        self.target.database(TARGET_DB).drop(None).unwrap();
    }
}

#[test]
#[ignore]
fn test_sync_and_resume() {
    let context = Context::new();
    let source_coll = context.source.database(SOURCE_DB).collection::<Document>("coll");
    source_coll.insert_one(doc! {"_id": 1, "answer": "unknown"}, None).unwrap();
    source_coll
        .update_one(doc! {"_id": 1}, doc! {"$set": {"answer": 42}}, None)
        .unwrap();
    source_coll.create_index(
        mongodb::IndexModel::builder().keys(doc! {"answer": 1}).build(),
        None,
    )
    .unwrap();

    let conf = context.conf();
    let summary = blocking::sync_once(&conf, Arc::new(AtomicBool::new(false))).unwrap();
    assert!(summary.applied >= 2);
    assert!(summary.checkpoint.is_some());

    let target_coll = context.target.database(TARGET_DB).collection::<Document>("coll");
    let record = target_coll.find_one(doc! {"_id": 1}, None).unwrap().unwrap();
    assert_eq!(record.get_i32("answer").unwrap(), 42);
    let indexes = target_coll.list_index_names().unwrap();
    assert!(indexes.contains(&"answer_1".to_string()));

    // nothing new, nothing applied.
    let summary = blocking::sync_once(&conf, Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(summary.applied, 0);

    source_coll.insert_one(doc! {"_id": 2}, None).unwrap();
    let summary = blocking::sync_once(&conf, Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(target_coll.count_documents(None, None).unwrap(), 2);
}

#[test]
#[ignore]
fn test_same_instance_needs_rename() {
    let context = Context::new();
    let mut conf = context.conf();
    conf.dst_uri = conf.src_uri.clone();
    conf.rename = vec![];

    let err = blocking::sync_once(&conf, Arc::new(AtomicBool::new(false))).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Startup));
}
