//! Reads the source oplog collection.

use std::thread;
use std::time::Duration;

use bson::{doc, Document, Timestamp};
use mongodb::options::{CursorType, FindOptions};
use mongodb::sync::{Collection, Cursor};
use tracing::{info, warn};

use super::oplog_helper::{get_earliest_ts, get_latest_ts};
use crate::oplog::Parsed;
use crate::retry::RetryPolicy;
use crate::syncer::{OplogSource, OplogStream, StartAt};
use crate::{time_helper, Result, SyncError, TIMESTAMP_KEY};

const BATCH_SIZE: u32 = 10000;

/// Oplog reader over one oplog collection.
///
/// In follow mode the cursor is tailable and waits for new entries, otherwise the read stops at
/// the end of the collection.
pub struct MongoOplogReader {
    oplog: Collection<Document>,
    follow: bool,
    retry: RetryPolicy,
    await_time: Duration,
}

impl MongoOplogReader {
    /// create a reader for `oplog`.
    pub fn new(oplog: Collection<Document>, follow: bool, retry: RetryPolicy, await_time: Duration) -> Self {
        MongoOplogReader {
            oplog,
            follow,
            retry,
            await_time,
        }
    }

    /// timestamp of the newest entry.
    pub fn latest_ts(&self) -> Result<Option<Timestamp>> {
        get_latest_ts(&self.oplog)
    }
}

impl OplogSource for MongoOplogReader {
    fn earliest_ts(&self) -> Result<Option<Timestamp>> {
        get_earliest_ts(&self.oplog)
    }

    fn read_from(&self, start: StartAt) -> Result<OplogStream> {
        if let (Some(earliest), Some(latest)) = (self.earliest_ts()?, self.latest_ts()?) {
            info!(
                ?start,
                earliest = %time_helper::to_datetime(&earliest),
                latest = %time_helper::to_datetime(&latest),
                "Begin to read oplog."
            );
            if let StartAt::From(from) = start {
                if from < earliest {
                    warn!(?from, ?earliest, "Start point is older than the earliest oplog entry, entries in between are lost.");
                }
            }
        }

        let mut cursor = OplogCursor {
            oplog: self.oplog.clone(),
            follow: self.follow,
            retry: self.retry.clone(),
            await_time: self.await_time,
            position: start,
            cursor: None,
            done: false,
        };
        cursor.open()?;
        Ok(Box::new(cursor))
    }
}

/// Cursor which reopens itself after the last returned entry when the connection drops.
struct OplogCursor {
    oplog: Collection<Document>,
    follow: bool,
    retry: RetryPolicy,
    await_time: Duration,
    position: StartAt,
    cursor: Option<Cursor<Document>>,
    done: bool,
}

impl OplogCursor {
    fn query_filter(&self) -> Option<Document> {
        match self.position {
            StartAt::After(ts) => Some(doc! {TIMESTAMP_KEY: {"$gt": ts}}),
            StartAt::From(ts) => Some(doc! {TIMESTAMP_KEY: {"$gte": ts}}),
            StartAt::Beginning => None,
        }
    }

    fn open(&mut self) -> Result<()> {
        let options = if self.follow {
            FindOptions::builder()
                .sort(doc! {"$natural": 1})
                .batch_size(BATCH_SIZE)
                .cursor_type(CursorType::TailableAwait)
                .max_await_time(self.await_time)
                .build()
        } else {
            FindOptions::builder()
                .sort(doc! {"$natural": 1})
                .batch_size(BATCH_SIZE)
                .build()
        };
        let filter = self.query_filter();
        let cursor = self.retry.run("open oplog cursor", || {
            Ok(self.oplog.find(filter.clone(), options.clone())?)
        })?;
        self.cursor = Some(cursor);
        Ok(())
    }
}

impl Iterator for OplogCursor {
    type Item = Result<Parsed>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut attempt = 0;
        loop {
            if self.done {
                return None;
            }
            if self.cursor.is_none() {
                if let Err(e) = self.open() {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            let next = match self.cursor.as_mut() {
                Some(cursor) => cursor.next(),
                None => None,
            };
            match next {
                Some(Ok(raw)) => {
                    let parsed = Parsed::from_doc(&raw);
                    if let Some(ts) = parsed.ts() {
                        self.position = StartAt::After(ts);
                    }
                    return Some(Ok(parsed));
                }
                Some(Err(e)) => {
                    let e = SyncError::from(e);
                    if e.is_connectivity() && attempt < self.retry.max_retries {
                        let delay = self.retry.delay(attempt);
                        warn!(position = ?self.position, ?delay, error = %e, "Read oplog failed, reopen cursor later.");
                        thread::sleep(delay);
                        attempt += 1;
                        self.cursor = None;
                        continue;
                    }
                    self.done = true;
                    return Some(Err(e));
                }
                // a tailable cursor dies when the collection had nothing after the filter.
                None if self.follow => {
                    thread::sleep(self.await_time);
                    self.cursor = None;
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::sync::Client;

    fn cursor(position: StartAt) -> OplogCursor {
        // the client connects lazily, no server is needed to build the query.
        let client = Client::with_uri_str("mongodb://localhost:27017").unwrap();
        OplogCursor {
            oplog: client.database("local").collection("oplog.rs"),
            follow: false,
            retry: RetryPolicy::default(),
            await_time: Duration::from_secs(1),
            position,
            cursor: None,
            done: false,
        }
    }

    #[test]
    fn test_query_filter_follows_position() {
        let ts = Timestamp {
            time: 1_600_000_000,
            increment: 3,
        };
        assert_eq!(cursor(StartAt::Beginning).query_filter(), None);
        assert_eq!(
            cursor(StartAt::After(ts)).query_filter(),
            Some(doc! {"ts": {"$gt": ts}})
        );
        assert_eq!(
            cursor(StartAt::From(ts)).query_filter(),
            Some(doc! {"ts": {"$gte": ts}})
        );
    }
}
