//! Buckets
//!
//! A bucket owns its settings, its partitions, its secret and the sinks
//! subscribed to its mutations. Partitions are created with the bucket and
//! dropped with it; their count never changes.

use crate::error::{BucketError, Result, run_blocking};
use crate::stats::BucketStats;
use crate::subscribers::{EventSink, PartitionPublisher, Subscribers};
use crate::vbucket::{VBState, VBucket};
use kvnode_storage::{BucketSettings, ItemStoreFactory};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub const HASH_FUNC_PLAIN: &str = "";
pub const HASH_FUNC_SHA256: &str = "sha256";

pub struct Bucket {
    name: Arc<str>,
    dir: PathBuf,
    num_partitions: u32,
    settings: RwLock<BucketSettings>,
    /// Serializes settings saves for this bucket
    save_lock: Mutex<()>,
    vbuckets: Vec<VBucket>,
    subscribers: Arc<Subscribers>,
    stats: Arc<BucketStats>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("num_partitions", &self.num_partitions)
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Build a bucket in memory; every partition starts Dead
    pub(crate) fn new(
        name: &str,
        dir: PathBuf,
        settings: BucketSettings,
        store_factory: &dyn ItemStoreFactory,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        let subscribers = Arc::new(Subscribers::default());
        let stats = Arc::new(BucketStats::default());

        let vbuckets = (0..settings.num_partitions)
            .map(|id| {
                let id = id as u16;
                let publisher = PartitionPublisher::new(name.clone(), id, subscribers.clone());
                VBucket::new(
                    id,
                    name.clone(),
                    store_factory.open(&name, id, Arc::new(publisher)),
                    stats.clone(),
                )
            })
            .collect();

        Self {
            name,
            dir,
            num_partitions: settings.num_partitions,
            settings: RwLock::new(settings),
            save_lock: Mutex::new(()),
            vbuckets,
            subscribers,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Copy of the live settings
    pub async fn settings(&self) -> BucketSettings {
        self.settings.read().await.clone()
    }

    pub fn vbucket(&self, id: u16) -> Option<&VBucket> {
        self.vbuckets.get(id as usize)
    }

    pub fn vbuckets(&self) -> &[VBucket] {
        &self.vbuckets
    }

    /// Set a partition's state, returning the previous one
    ///
    /// `None` when the bucket has no partition `id`.
    pub async fn set_vbucket_state(&self, id: u16, state: VBState) -> Option<VBState> {
        match self.vbucket(id) {
            Some(vb) => Some(vb.set_state(state).await),
            None => None,
        }
    }

    /// Number of partitions in each state, in [`VBState::ALL`] order
    pub async fn vbucket_state_counts(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for vb in &self.vbuckets {
            let state = vb.state().await;
            if let Some(i) = VBState::ALL.iter().position(|s| *s == state) {
                counts[i] += 1;
            }
        }
        counts
    }

    pub fn item_count(&self) -> usize {
        self.vbuckets.iter().map(VBucket::item_count).sum()
    }

    pub fn stats(&self) -> &BucketStats {
        &self.stats
    }

    /// Check a client-supplied secret against the stored one
    pub async fn auth(&self, secret: &[u8]) -> bool {
        let settings = self.settings.read().await;
        match settings.password_hash_func.as_str() {
            HASH_FUNC_PLAIN => settings.password_hash.as_bytes() == secret,
            HASH_FUNC_SHA256 => {
                hash_secret(&settings.password_salt, secret) == settings.password_hash
            }
            other => {
                tracing::warn!(
                    "Bucket {} has unsupported password hash function {:?}",
                    self.name,
                    other
                );
                false
            }
        }
    }

    /// Replace the secret with a freshly salted hash and persist it
    pub async fn set_password(&self, secret: &str) -> Result<()> {
        let salt = hex::encode(rand::random::<[u8; 16]>());
        let hash = hash_secret(&salt, secret.as_bytes());
        self.update_settings(|s| {
            s.password_hash_func = HASH_FUNC_SHA256.to_string();
            s.password_hash = hash;
            s.password_salt = salt;
        })
        .await?;
        Ok(())
    }

    /// Apply `f` to a copy of the settings, persist the copy, then make it live
    ///
    /// The partition count cannot be changed this way.
    pub async fn update_settings<F>(&self, f: F) -> Result<BucketSettings>
    where
        F: FnOnce(&mut BucketSettings),
    {
        let _save = self.save_lock.lock().await;

        let mut updated = self.settings().await;
        f(&mut updated);
        if updated.num_partitions != self.num_partitions {
            return Err(BucketError::InvalidSettings(format!(
                "numPartitions is fixed at {} for bucket {}",
                self.num_partitions, self.name
            )));
        }

        self.persist(updated.clone()).await?;
        *self.settings.write().await = updated.clone();

        tracing::debug!("Saved settings for bucket {}", self.name);
        Ok(updated)
    }

    /// Persist the live settings
    pub async fn save_settings(&self) -> Result<()> {
        let _save = self.save_lock.lock().await;
        let settings = self.settings().await;
        self.persist(settings).await
    }

    /// Write `settings.json`; callers hold `save_lock`
    async fn persist(&self, settings: BucketSettings) -> Result<()> {
        let dir = self.dir.clone();
        run_blocking(move || Ok(settings.save(&dir)?)).await
    }

    pub fn subscribe(&self, sink: EventSink) {
        self.subscribers.subscribe(sink);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Disconnect every subscriber
    pub(crate) fn close_subscribers(&self) {
        self.subscribers.clear();
    }
}

fn hash_secret(salt: &str, secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret);
    hex::encode(hasher.finalize())
}
