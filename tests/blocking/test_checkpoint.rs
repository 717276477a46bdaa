use bson::Timestamp;
use mongodb::sync::Client;

use mongo_oplog::blocking::MongoCheckpointStore;
use mongo_oplog::CheckpointStore;

const TEST_DB: &str = "checkpoint_test";

struct Context {
    pub client: Client,
}

impl Drop for Context {
    fn drop(&mut self) {
        self.client.database(TEST_DB).drop(None).unwrap();
    }
}

#[test]
#[ignore]
fn test_save_and_load() {
    let context = Context {
        client: Client::with_uri_str(super::target_uri()).unwrap(),
    };
    let store = MongoCheckpointStore::new(&context.client, TEST_DB, "checkpoints", "rs0");
    let other = MongoCheckpointStore::new(&context.client, TEST_DB, "checkpoints", "rs1");
    assert_eq!(store.load().unwrap(), None);

    let ts = Timestamp {
        time: 1620000000,
        increment: 3,
    };
    store.save(ts).unwrap();
    assert_eq!(store.load().unwrap(), Some(ts));
    assert_eq!(other.load().unwrap(), None);

    let newer = Timestamp {
        time: 1620000001,
        increment: 1,
    };
    store.save(newer).unwrap();
    assert_eq!(store.load().unwrap(), Some(newer));
}
