//! Bucket registry
//!
//! Every registered bucket lives in `<root>/<name>-bucket`. Membership
//! changes take the registry's write lock, lookups its read lock, so a
//! lookup never sees a bucket that is still being created.

use crate::bucket::Bucket;
use crate::error::{BucketError, Result, run_blocking};
use crate::subscribers::EventSink;
use kvnode_storage::{BucketSettings, ItemStoreFactory, MemoryStoreFactory, StorageResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const BUCKET_DIR_SUFFIX: &str = "-bucket";

const MAX_NAME_LEN: usize = 255;

/// Outcome of scanning the data root
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Directory name and reason, for buckets that could not be loaded
    pub failed: Vec<(String, String)>,
}

pub struct Buckets {
    root: PathBuf,
    default_settings: BucketSettings,
    store_factory: Arc<dyn ItemStoreFactory>,
    event_sink: Option<EventSink>,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl Buckets {
    /// Registry over `root`, creating the directory if needed
    ///
    /// Buckets created through [`Buckets::create`] start from
    /// `default_settings`.
    pub fn new<P: AsRef<Path>>(root: P, default_settings: BucketSettings) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        default_settings
            .validate()
            .map_err(|e| BucketError::InvalidSettings(e.to_string()))?;

        Ok(Self {
            root,
            default_settings,
            store_factory: Arc::new(MemoryStoreFactory),
            event_sink: None,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_store_factory(mut self, store_factory: Arc<dyn ItemStoreFactory>) -> Self {
        self.store_factory = store_factory;
        self
    }

    /// Subscribe `sink` to every bucket this registry creates or loads
    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn create(&self, name: &str) -> Result<Arc<Bucket>> {
        self.create_with_settings(name, self.default_settings.clone())
            .await
    }

    /// Create, persist and register a new bucket
    pub async fn create_with_settings(
        &self,
        name: &str,
        settings: BucketSettings,
    ) -> Result<Arc<Bucket>> {
        validate_name(name)?;
        settings
            .validate()
            .map_err(|e| BucketError::InvalidSettings(e.to_string()))?;

        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(name) {
            return Err(BucketError::AlreadyExists(name.to_string()));
        }

        let dir = self.bucket_dir(name);
        tokio::fs::create_dir_all(&dir).await?;
        let existing = {
            let dir = dir.clone();
            run_blocking(move || Ok(BucketSettings::load(&dir)?)).await?
        };
        if existing.is_some() {
            return Err(BucketError::AlreadyExists(format!(
                "{} (unregistered directory {})",
                name,
                dir.display()
            )));
        }

        let bucket = Arc::new(self.build(name, dir, settings));
        bucket.save_settings().await?;
        buckets.insert(name.to_string(), bucket.clone());

        tracing::info!(
            "Created bucket {} with {} partitions",
            name,
            bucket.num_partitions()
        );
        Ok(bucket)
    }

    /// Register every `*-bucket` directory under the root
    ///
    /// A bucket that fails to load is reported and skipped. Buckets already
    /// registered are left alone.
    pub async fn load_all(&self) -> Result<LoadReport> {
        let root = self.root.clone();
        let scanned = run_blocking(move || scan_root(&root)).await?;

        let mut report = LoadReport::default();
        let mut buckets = self.buckets.write().await;

        for (dir_name, loaded) in scanned {
            let Some(name) = dir_name.strip_suffix(BUCKET_DIR_SUFFIX) else {
                continue;
            };
            if buckets.contains_key(name) {
                continue;
            }
            if let Err(e) = validate_name(name) {
                tracing::warn!("Skipping bucket directory {}: {}", dir_name, e);
                report.failed.push((dir_name.clone(), e.to_string()));
                continue;
            }

            let dir = self.root.join(&dir_name);
            match loaded {
                Ok(Some(settings)) => {
                    let bucket = Arc::new(self.build(name, dir, settings));
                    tracing::info!(
                        "Loaded bucket {} with {} partitions",
                        name,
                        bucket.num_partitions()
                    );
                    buckets.insert(name.to_string(), bucket);
                    report.loaded.push(name.to_string());
                }
                Ok(None) => {
                    tracing::warn!("Bucket directory {} has no settings file", dir_name);
                    report
                        .failed
                        .push((dir_name.clone(), "missing settings.json".to_string()));
                }
                Err(e) => {
                    tracing::error!("Failed to load bucket {}: {}", dir_name, e);
                    report.failed.push((dir_name.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Unregister a bucket and remove its directory
    ///
    /// Its subscribers see their event streams end.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let bucket = self
            .buckets
            .write()
            .await
            .remove(name)
            .ok_or_else(|| BucketError::NotFound(name.to_string()))?;

        bucket.close_subscribers();
        tokio::fs::remove_dir_all(bucket.dir()).await?;

        tracing::info!("Destroyed bucket {}", name);
        Ok(())
    }

    fn bucket_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, BUCKET_DIR_SUFFIX))
    }

    fn build(&self, name: &str, dir: PathBuf, settings: BucketSettings) -> Bucket {
        let bucket = Bucket::new(name, dir, settings, self.store_factory.as_ref());
        if let Some(sink) = &self.event_sink {
            bucket.subscribe(sink.clone());
        }
        bucket
    }
}

/// Settings of every `*-bucket` directory under `root`, in name order
fn scan_root(root: &Path) -> Result<Vec<(String, StorageResult<Option<BucketSettings>>)>> {
    let mut dir_names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && dir_name.ends_with(BUCKET_DIR_SUFFIX) {
            dir_names.push(dir_name);
        }
    }
    dir_names.sort();

    Ok(dir_names
        .into_iter()
        .map(|dir_name| {
            let settings = BucketSettings::load(&root.join(&dir_name));
            (dir_name, settings)
        })
        .collect())
}

/// Bucket names become directory names, so keep them to a safe alphabet
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BucketError::InvalidName(format!(
            "length must be 1..={}, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    if name.contains("..") {
        return Err(BucketError::InvalidName(format!("{:?} contains '..'", name)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(BucketError::InvalidName(format!(
            "{:?} may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}
