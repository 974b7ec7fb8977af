//! Mutation events published by buckets to their subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Set,
    Delete,
}

/// One successful mutation of an item in a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub bucket: String,
    pub vbucket: u16,
    pub kind: MutationKind,
    pub key: Vec<u8>,
    /// Empty for deletions
    pub value: Vec<u8>,
    pub flags: u32,
    pub expiration: u32,
    pub cas: u64,
    pub timestamp: DateTime<Utc>,
}

impl MutationEvent {
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}
