//! kvnode Storage
//!
//! This crate provides the durable and in-memory storage pieces of a node:
//! - Bucket settings with crash-safe replace-with-backup persistence
//! - The per-partition item store capability and an in-memory engine

mod atomic_writer;
pub mod memory;
pub mod settings;
pub mod traits;

pub use memory::{MemoryItemStore, MemoryStoreFactory};
pub use settings::BucketSettings;
pub use traits::{
    Delta, Item, ItemError, ItemStore, ItemStoreFactory, MutationListener, StorageError,
    StorageResult, StoreMode,
};
