//! Tests against live mongodb deployments, configured by `SYNCER_TEST_SOURCE` and
//! `SYNCER_TEST_TARGET` at build time.  The source must be a replica set member.
//!
//! Run them with `cargo test -- --ignored`.

mod test_applier;
mod test_checkpoint;
mod test_sync;

pub fn source_uri() -> &'static str {
    option_env!("SYNCER_TEST_SOURCE").unwrap_or("mongodb://localhost:27017")
}

pub fn target_uri() -> &'static str {
    option_env!("SYNCER_TEST_TARGET").unwrap_or("mongodb://localhost:27017")
}
