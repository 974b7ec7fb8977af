//! kvnode Buckets
//!
//! A bucket is a named, independently authenticated keyspace split into a
//! fixed number of partitions (vbuckets). This crate provides:
//! - Key to partition routing and state-gated partition lookup
//! - Partitions dispatching data opcodes to their item store
//! - Buckets owning settings, partitions, secrets and event subscribers
//! - The registry of all buckets under a data directory

pub mod bucket;
pub mod buckets;
pub mod error;
pub mod router;
pub mod stats;
pub mod subscribers;
pub mod vbucket;

pub use bucket::Bucket;
pub use buckets::{Buckets, LoadReport};
pub use error::{BucketError, Result};
pub use router::{get_item, set_item, vbucket_id_for_key};
pub use subscribers::EventSink;
pub use vbucket::{VBState, VBucket, VBucketGuard};
