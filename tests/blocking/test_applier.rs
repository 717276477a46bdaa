// Only test for MongoApplier.

use bson::{doc, Bson, Document, Timestamp};
use mongodb::sync::Client;

use mongo_oplog::blocking::MongoApplier;
use mongo_oplog::cmd_oplog::CmdOplog;
use mongo_oplog::{ApplyOutcome, LogEntry, Namespace, OplogApplier, Operation};

const TEST_DB: &str = "applier_test";

struct Context {
    pub client: Client,
    pub applier: MongoApplier,
}

impl Context {
    pub fn new() -> Self {
        let client = Client::with_uri_str(super::target_uri()).unwrap();
        let applier = MongoApplier::new(client.clone());
        Context { client, applier }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.client.database(TEST_DB).drop(None).unwrap();
    }
}

fn entry(coll: &str, op: Operation) -> LogEntry {
    LogEntry {
        ts: Timestamp {
            time: 10,
            increment: 0,
        },
        ns: Namespace::new(TEST_DB, coll),
        op,
    }
}

#[test]
#[ignore]
fn test_document_writes_are_idempotent() {
    let context = Context::new();
    let coll = context.client.database(TEST_DB).collection::<Document>("coll");

    let insert = entry(
        "coll",
        Operation::Insert {
            document: doc! {"_id": 1, "answer": "unknown"},
        },
    );
    assert_eq!(context.applier.apply(&insert).unwrap(), ApplyOutcome::Applied);
    assert_eq!(context.applier.apply(&insert).unwrap(), ApplyOutcome::NoOp);

    let update = entry(
        "coll",
        Operation::Update {
            criteria: doc! {"_id": 1},
            modifier: doc! {"$v": 1, "$set": {"answer": 42}},
            upsert: false,
        },
    );
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::Applied);
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::NoOp);
    let record = coll.find_one(doc! {"_id": 1}, None).unwrap().unwrap();
    assert_eq!(record.get("answer"), Some(&Bson::Int32(42)));

    let replace = entry(
        "coll",
        Operation::Update {
            criteria: doc! {"_id": 1},
            modifier: doc! {"_id": 1, "replaced": true},
            upsert: false,
        },
    );
    assert_eq!(context.applier.apply(&replace).unwrap(), ApplyOutcome::Applied);
    let record = coll.find_one(doc! {"_id": 1}, None).unwrap().unwrap();
    assert_eq!(record, doc! {"_id": 1, "replaced": true});

    let delete = entry(
        "coll",
        Operation::Delete {
            criteria: doc! {"_id": 1},
        },
    );
    assert_eq!(context.applier.apply(&delete).unwrap(), ApplyOutcome::Applied);
    assert_eq!(context.applier.apply(&delete).unwrap(), ApplyOutcome::NoOp);
    assert_eq!(coll.count_documents(None, None).unwrap(), 0);
}

#[test]
#[ignore]
fn test_delta_update_is_idempotent() {
    let context = Context::new();
    let coll = context.client.database(TEST_DB).collection::<Document>("delta");
    let insert = entry(
        "delta",
        Operation::Insert {
            document: doc! {"_id": 1, "a": 1, "b": {"c": 1}, "gone": true},
        },
    );
    assert_eq!(context.applier.apply(&insert).unwrap(), ApplyOutcome::Applied);

    let update = entry(
        "delta",
        Operation::Update {
            criteria: doc! {"_id": 1},
            modifier: doc! {"$v": 2, "diff": {"u": {"a": 2}, "d": {"gone": false}, "sb": {"i": {"d": 3}}}},
            upsert: false,
        },
    );
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::Applied);
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::NoOp);
    let record = coll.find_one(doc! {"_id": 1}, None).unwrap().unwrap();
    assert_eq!(record, doc! {"_id": 1, "a": 2, "b": {"c": 1, "d": 3}});
}

#[test]
#[ignore]
fn test_delta_update_of_missing_document() {
    let context = Context::new();
    let coll = context.client.database(TEST_DB).collection::<Document>("delta_missing");
    let update = entry(
        "delta_missing",
        Operation::Update {
            criteria: doc! {"_id": 7},
            modifier: doc! {"$v": 2, "diff": {"u": {"a": 2}}},
            upsert: false,
        },
    );
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::NoOp);
    assert_eq!(coll.count_documents(None, None).unwrap(), 0);
}

#[test]
#[ignore]
fn test_update_of_missing_document_without_upsert() {
    let context = Context::new();
    let update = entry(
        "missing",
        Operation::Update {
            criteria: doc! {"_id": 1},
            modifier: doc! {"$set": {"a": 1}},
            upsert: false,
        },
    );
    assert_eq!(context.applier.apply(&update).unwrap(), ApplyOutcome::NoOp);
    let coll = context.client.database(TEST_DB).collection::<Document>("missing");
    assert_eq!(coll.count_documents(None, None).unwrap(), 0);
}

#[test]
#[ignore]
fn test_commands_are_idempotent() {
    let context = Context::new();
    let ns = Namespace::new(TEST_DB, "indexed");

    let create = entry(
        "$cmd",
        Operation::Command(CmdOplog::CreateCollection {
            ns: ns.clone(),
            view_on: None,
            options: doc! {},
        }),
    );
    assert_eq!(context.applier.apply(&create).unwrap(), ApplyOutcome::Applied);
    // newer servers accept an identical create, older ones report the namespace exists.
    assert!(context.applier.apply(&create).is_ok());

    let index = entry(
        "$cmd",
        Operation::Command(CmdOplog::CreateIndexes {
            ns: ns.clone(),
            indexes: vec![doc! {"v": 2, "key": {"msg": 1}, "name": "msg_1"}],
        }),
    );
    assert_eq!(context.applier.apply(&index).unwrap(), ApplyOutcome::Applied);
    assert_eq!(context.applier.apply(&index).unwrap(), ApplyOutcome::NoOp);

    let drop = entry("$cmd", Operation::Command(CmdOplog::DropCollection(ns)));
    assert_eq!(context.applier.apply(&drop).unwrap(), ApplyOutcome::Applied);
    assert!(context.applier.apply(&drop).is_ok());
}
