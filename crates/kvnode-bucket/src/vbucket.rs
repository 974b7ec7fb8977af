//! Partitions (vbuckets)
//!
//! Each partition carries a state and the item store holding its share of
//! the bucket's keys. Data operations only run while the partition is in
//! the state they require, and the state lock is held shared for the whole
//! check-then-operate sequence. State transitions take it exclusively, so
//! they wait for in-flight operations and no operation sees a state change
//! halfway through.
//!
//! Mutation events come from the item store's listener, not from here.

use crate::stats::BucketStats;
use bytes::{Buf, BufMut, BytesMut};
use kvnode_core::protocol::{Opcode, Request, Response, Status};
use kvnode_storage::{Delta, Item, ItemError, ItemStore, StoreMode};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Expiration value in INCR/DECR extras meaning "do not create"
const NO_AUTO_CREATE: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VBState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBState {
    pub const ALL: [VBState; 4] = [
        VBState::Active,
        VBState::Replica,
        VBState::Pending,
        VBState::Dead,
    ];

    /// Wire encoding used by SET_VBUCKET / GET_VBUCKET
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(VBState::Active),
            2 => Some(VBState::Replica),
            3 => Some(VBState::Pending),
            4 => Some(VBState::Dead),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            VBState::Active => 1,
            VBState::Replica => 2,
            VBState::Pending => 3,
            VBState::Dead => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VBState::Active => "active",
            VBState::Replica => "replica",
            VBState::Pending => "pending",
            VBState::Dead => "dead",
        }
    }
}

impl fmt::Display for VBState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One partition of a bucket
pub struct VBucket {
    id: u16,
    bucket: Arc<str>,
    state: RwLock<VBState>,
    store: Arc<dyn ItemStore>,
    stats: Arc<BucketStats>,
}

impl fmt::Debug for VBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBucket")
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl VBucket {
    /// New partitions start out Dead
    pub(crate) fn new(
        id: u16,
        bucket: Arc<str>,
        store: Arc<dyn ItemStore>,
        stats: Arc<BucketStats>,
    ) -> Self {
        Self {
            id,
            bucket,
            state: RwLock::new(VBState::Dead),
            store,
            stats,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub async fn state(&self) -> VBState {
        *self.state.read().await
    }

    /// Change state, waiting out any operation holding the partition
    ///
    /// Returns the previous state.
    pub async fn set_state(&self, new_state: VBState) -> VBState {
        let mut state = self.state.write().await;
        let previous = std::mem::replace(&mut *state, new_state);
        if previous != new_state {
            tracing::info!(
                "Bucket {} vbucket {}: {} -> {}",
                self.bucket,
                self.id,
                previous,
                new_state
            );
        }
        previous
    }

    /// Hold the partition in `required` state, or `None` if it is elsewhere
    pub async fn gate(&self, required: VBState) -> Option<VBucketGuard<'_>> {
        let state = self.state.read().await;
        if *state != required {
            return None;
        }
        Some(VBucketGuard {
            vbucket: self,
            _state: state,
        })
    }

    /// Run a data opcode against this partition
    ///
    /// Anything but an Active partition answers NOT_MY_VBUCKET.
    pub async fn dispatch(&self, req: &Request) -> Response {
        match self.gate(VBState::Active).await {
            Some(guard) => guard.dispatch(req),
            None => {
                BucketStats::incr(&self.stats.not_my_vbucket);
                Response::status(Status::NotMyVBucket)
            }
        }
    }

    pub fn item_count(&self) -> usize {
        self.store.len()
    }
}

/// A partition held in a known state
///
/// Dropping the guard releases the partition's state lock.
pub struct VBucketGuard<'a> {
    vbucket: &'a VBucket,
    _state: RwLockReadGuard<'a, VBState>,
}

impl VBucketGuard<'_> {
    pub fn id(&self) -> u16 {
        self.vbucket.id
    }

    pub fn snapshot(&self) -> Vec<Item> {
        self.vbucket.store.snapshot()
    }

    pub fn dispatch(&self, req: &Request) -> Response {
        match req.opcode {
            Opcode::Get | Opcode::GetK => self.get(req),
            Opcode::Set => self.store(req, StoreMode::Set),
            Opcode::Add => self.store(req, StoreMode::Add),
            Opcode::Replace => self.store(req, StoreMode::Replace),
            Opcode::Append => self.store(req, StoreMode::Append),
            Opcode::Prepend => self.store(req, StoreMode::Prepend),
            Opcode::Delete => self.delete(req),
            Opcode::Increment => self.arithmetic(req, Delta::Incr),
            Opcode::Decrement => self.arithmetic(req, Delta::Decr),
            other => {
                tracing::debug!("Unknown data opcode {:?}", other);
                Response::status(Status::UnknownCommand)
            }
        }
    }

    fn get(&self, req: &Request) -> Response {
        let vb = self.vbucket;
        BucketStats::incr(&vb.stats.cmd_get);
        if req.key.is_empty() || !req.extras.is_empty() {
            return Response::status(Status::InvalidArgument);
        }

        let Some(item) = vb.store.get(&req.key) else {
            BucketStats::incr(&vb.stats.get_misses);
            return Response::status(Status::KeyNotFound);
        };
        BucketStats::incr(&vb.stats.get_hits);

        let res = Response::ok()
            .with_extras(item.flags.to_be_bytes().to_vec())
            .with_body(item.value)
            .with_cas(item.cas);
        if req.opcode == Opcode::GetK {
            res.with_key(req.key.clone())
        } else {
            res
        }
    }

    fn store(&self, req: &Request, mode: StoreMode) -> Response {
        let vb = self.vbucket;
        BucketStats::incr(&vb.stats.cmd_set);
        if req.key.is_empty() {
            return Response::status(Status::InvalidArgument);
        }

        let (flags, expiration) = match mode {
            StoreMode::Append | StoreMode::Prepend => {
                if !req.extras.is_empty() {
                    return Response::status(Status::InvalidArgument);
                }
                (0, 0)
            }
            _ => {
                if req.extras.len() != 8 {
                    return Response::status(Status::InvalidArgument);
                }
                let mut extras = &req.extras[..];
                (extras.get_u32(), extras.get_u32())
            }
        };

        let item = Item {
            key: req.key.to_vec(),
            value: req.body.to_vec(),
            flags,
            expiration,
            cas: 0,
        };

        match vb.store.store(mode, item, req.cas) {
            Ok(stored) => Response::ok().with_cas(stored.cas),
            Err(e) => item_error(e),
        }
    }

    fn delete(&self, req: &Request) -> Response {
        let vb = self.vbucket;
        if req.key.is_empty() || !req.extras.is_empty() {
            return Response::status(Status::InvalidArgument);
        }

        match vb.store.delete(&req.key, req.cas) {
            Ok(cas) => {
                BucketStats::incr(&vb.stats.delete_hits);
                Response::ok().with_cas(cas)
            }
            Err(e) => {
                if e == ItemError::NotFound {
                    BucketStats::incr(&vb.stats.delete_misses);
                }
                item_error(e)
            }
        }
    }

    fn arithmetic(&self, req: &Request, delta: fn(u64) -> Delta) -> Response {
        let vb = self.vbucket;
        BucketStats::incr(&vb.stats.cmd_set);
        if req.key.is_empty() || req.extras.len() != 20 {
            return Response::status(Status::InvalidArgument);
        }

        let mut extras = &req.extras[..];
        let amount = extras.get_u64();
        let initial = extras.get_u64();
        let expiration = extras.get_u32();
        let initial = (expiration != NO_AUTO_CREATE).then_some(initial);

        match vb
            .store
            .arithmetic(&req.key, delta(amount), initial, expiration, req.cas)
        {
            Ok((value, stored)) => {
                let mut body = BytesMut::with_capacity(8);
                body.put_u64(value);
                Response::ok().with_body(body.freeze()).with_cas(stored.cas)
            }
            Err(e) => item_error(e),
        }
    }
}

fn item_error(e: ItemError) -> Response {
    let status = match e {
        ItemError::NotFound => Status::KeyNotFound,
        ItemError::Exists => Status::KeyExists,
        ItemError::NotStored => Status::NotStored,
        ItemError::NonNumeric => Status::DeltaBadValue,
    };
    Response::status(status).with_body(e.to_string())
}
