//! Storage trait definitions

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    /// Stored as given; expiry is enforced by the engine's eviction policy, if any
    pub expiration: u32,
    pub cas: u64,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// How `ItemStore::store` treats an existing or missing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Counter adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Incr(u64),
    Decr(u64),
}

/// Outcome of a rejected item operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("Not found")]
    NotFound,

    #[error("Data exists for key")]
    Exists,

    #[error("Not stored")]
    NotStored,

    #[error("Non-numeric server-side value for incr or decr")]
    NonNumeric,
}

/// Observer of a store's successful mutations
///
/// Called while the mutated key is still locked, so calls for one key arrive
/// in CAS order. Implementations must not block or call back into the store.
pub trait MutationListener: Send + Sync {
    fn stored(&self, item: &Item);

    fn deleted(&self, key: &[u8], cas: u64);
}

/// Document storage for a single partition
///
/// Implementations are internally synchronized: each call is atomic with
/// respect to other calls on the same store, including the CAS comparison.
/// A `cas` argument of zero disables the comparison.
pub trait ItemStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Item>;

    /// Store `item` according to `mode`, returning the item as stored
    fn store(&self, mode: StoreMode, item: Item, cas: u64) -> Result<Item, ItemError>;

    /// Remove `key`, returning the CAS assigned to the deletion
    fn delete(&self, key: &[u8], cas: u64) -> Result<u64, ItemError>;

    /// Adjust a decimal counter; a missing key is created from `initial` when given
    fn arithmetic(
        &self,
        key: &[u8],
        delta: Delta,
        initial: Option<u64>,
        expiration: u32,
        cas: u64,
    ) -> Result<(u64, Item), ItemError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every item
    fn snapshot(&self) -> Vec<Item>;
}

/// Opens the item store backing one partition of a bucket
pub trait ItemStoreFactory: Send + Sync {
    /// `listener` hears about every mutation the store applies
    fn open(
        &self,
        bucket: &str,
        vbucket: u16,
        listener: Arc<dyn MutationListener>,
    ) -> Arc<dyn ItemStore>;
}
