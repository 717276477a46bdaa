use bson::{doc, Document, Timestamp};
use mongodb::options::FindOneOptions;
use mongodb::sync::Collection;

use crate::{Result, TIMESTAMP_KEY};

enum Natural {
    Earliest,
    Latest,
}

/// timestamp of the oldest entry still retained in `coll`.
pub fn get_earliest_ts(coll: &Collection<Document>) -> Result<Option<Timestamp>> {
    get_one_oplog_ts(coll, Natural::Earliest)
}

/// timestamp of the newest entry in `coll`.
pub fn get_latest_ts(coll: &Collection<Document>) -> Result<Option<Timestamp>> {
    get_one_oplog_ts(coll, Natural::Latest)
}

fn get_one_oplog_ts(coll: &Collection<Document>, natural: Natural) -> Result<Option<Timestamp>> {
    let sorted_doc = match natural {
        Natural::Earliest => doc! {"$natural": 1},
        Natural::Latest => doc! {"$natural": -1},
    };

    let oplog = coll.find_one(None, FindOneOptions::builder().sort(sorted_doc).build())?;
    Ok(oplog.map(|d| d.get_timestamp(TIMESTAMP_KEY)).transpose()?)
}
