use bson::{doc, DateTime, Document, Timestamp};
use mongodb::options::{Acknowledgment, CollectionOptions, UpdateOptions, WriteConcern};
use mongodb::sync::{Client, Collection};
use tracing::debug;

use crate::checkpoint::CheckpointStore;
use crate::{Result, TIMESTAMP_KEY};

/// Checkpoint saved as `{_id: key, ts, updated_at}` in a collection of the destination.
pub struct MongoCheckpointStore {
    coll: Collection<Document>,
    key: String,
}

impl MongoCheckpointStore {
    /// create a store in `db.coll` of `client`, the record is identified by `key`.
    pub fn new(client: &Client, db: &str, coll: &str, key: impl Into<String>) -> Self {
        let options = CollectionOptions::builder()
            .write_concern(checkpoint_write_concern())
            .build();
        MongoCheckpointStore {
            coll: client.database(db).collection_with_options(coll, options),
            key: key.into(),
        }
    }

    /// checkpoint record key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl CheckpointStore for MongoCheckpointStore {
    fn load(&self) -> Result<Option<Timestamp>> {
        let record = self.coll.find_one(doc! {"_id": self.key.as_str()}, None)?;
        Ok(record.map(|d| d.get_timestamp(TIMESTAMP_KEY)).transpose()?)
    }

    fn save(&self, ts: Timestamp) -> Result<()> {
        self.coll.update_one(
            doc! {"_id": self.key.as_str()},
            doc! {"$set": {TIMESTAMP_KEY: ts, "updated_at": DateTime::now()}},
            UpdateOptions::builder().upsert(true).build(),
        )?;
        debug!(key = %self.key, ?ts, "Write checkpoint record.");
        Ok(())
    }
}

/// the checkpoint must survive a failover of the destination.
fn checkpoint_write_concern() -> WriteConcern {
    WriteConcern::builder()
        .w(Acknowledgment::Majority)
        .journal(true)
        .build()
}
