//! In-memory item store

use crate::traits::{
    Delta, Item, ItemError, ItemStore, ItemStoreFactory, MutationListener, StoreMode,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Item store held entirely in memory
///
/// Each key's entry is updated under its shard lock, so CAS checks and the
/// write that follows them cannot interleave with another writer. The
/// listener is told about a mutation before that lock is released.
#[derive(Default)]
pub struct MemoryItemStore {
    items: DashMap<Vec<u8>, Item>,
    last_cas: AtomicU64,
    listener: Option<Arc<dyn MutationListener>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: Arc<dyn MutationListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::default()
        }
    }

    fn next_cas(&self) -> u64 {
        self.last_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn notify_stored(&self, item: &Item) {
        if let Some(listener) = &self.listener {
            listener.stored(item);
        }
    }
}

impl ItemStore for MemoryItemStore {
    fn get(&self, key: &[u8]) -> Option<Item> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    fn store(&self, mode: StoreMode, item: Item, cas: u64) -> Result<Item, ItemError> {
        match self.items.entry(item.key.clone()) {
            Entry::Occupied(mut entry) => {
                if mode == StoreMode::Add {
                    return Err(ItemError::Exists);
                }
                let current = entry.get();
                if cas != 0 && current.cas != cas {
                    return Err(ItemError::Exists);
                }

                let new_cas = self.next_cas();
                let stored = match mode {
                    StoreMode::Append => {
                        let mut value = current.value.clone();
                        value.extend_from_slice(&item.value);
                        Item {
                            value,
                            cas: new_cas,
                            ..current.clone()
                        }
                    }
                    StoreMode::Prepend => {
                        let mut value = item.value;
                        value.extend_from_slice(&current.value);
                        Item {
                            value,
                            cas: new_cas,
                            ..current.clone()
                        }
                    }
                    _ => Item {
                        cas: new_cas,
                        ..item
                    },
                };
                entry.insert(stored.clone());
                self.notify_stored(&stored);
                Ok(stored)
            }
            Entry::Vacant(entry) => {
                if cas != 0 {
                    return Err(ItemError::NotFound);
                }
                match mode {
                    StoreMode::Replace => Err(ItemError::NotFound),
                    StoreMode::Append | StoreMode::Prepend => Err(ItemError::NotStored),
                    StoreMode::Set | StoreMode::Add => {
                        let stored = Item {
                            cas: self.next_cas(),
                            ..item
                        };
                        let inserted = entry.insert(stored);
                        self.notify_stored(inserted.value());
                        Ok(inserted.value().clone())
                    }
                }
            }
        }
    }

    fn delete(&self, key: &[u8], cas: u64) -> Result<u64, ItemError> {
        match self.items.entry(key.to_vec()) {
            Entry::Occupied(entry) => {
                if cas != 0 && entry.get().cas != cas {
                    return Err(ItemError::Exists);
                }
                let cas = self.next_cas();
                if let Some(listener) = &self.listener {
                    listener.deleted(key, cas);
                }
                entry.remove();
                Ok(cas)
            }
            Entry::Vacant(_) => Err(ItemError::NotFound),
        }
    }

    fn arithmetic(
        &self,
        key: &[u8],
        delta: Delta,
        initial: Option<u64>,
        expiration: u32,
        cas: u64,
    ) -> Result<(u64, Item), ItemError> {
        match self.items.entry(key.to_vec()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if cas != 0 && current.cas != cas {
                    return Err(ItemError::Exists);
                }
                let value = std::str::from_utf8(&current.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or(ItemError::NonNumeric)?;
                let value = match delta {
                    Delta::Incr(d) => value.wrapping_add(d),
                    Delta::Decr(d) => value.saturating_sub(d),
                };
                let stored = Item {
                    value: value.to_string().into_bytes(),
                    cas: self.next_cas(),
                    ..current.clone()
                };
                entry.insert(stored.clone());
                self.notify_stored(&stored);
                Ok((value, stored))
            }
            Entry::Vacant(entry) => {
                if cas != 0 {
                    return Err(ItemError::NotFound);
                }
                let value = initial.ok_or(ItemError::NotFound)?;
                let stored = Item {
                    key: key.to_vec(),
                    value: value.to_string().into_bytes(),
                    flags: 0,
                    expiration,
                    cas: self.next_cas(),
                };
                let inserted = entry.insert(stored);
                self.notify_stored(inserted.value());
                Ok((value, inserted.value().clone()))
            }
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn snapshot(&self) -> Vec<Item> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Opens a fresh [`MemoryItemStore`] for every partition
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStoreFactory;

impl ItemStoreFactory for MemoryStoreFactory {
    fn open(
        &self,
        _bucket: &str,
        _vbucket: u16,
        listener: Arc<dyn MutationListener>,
    ) -> Arc<dyn ItemStore> {
        Arc::new(MemoryItemStore::with_listener(listener))
    }
}
