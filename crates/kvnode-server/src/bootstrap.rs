//! Startup: load existing buckets and make sure the default bucket is usable

use crate::config::ServerConfig;
use kvnode_bucket::{Buckets, EventSink, VBState};
use std::sync::Arc;
use tracing::{info, warn};

/// Build the registry over the configured data directory
///
/// Buckets that fail to load are logged and skipped. The default bucket is
/// created when missing, and its partition 0 is made Active when Dead since
/// partition states do not survive a restart.
pub async fn bootstrap(
    config: &ServerConfig,
    event_sink: Option<EventSink>,
) -> anyhow::Result<Arc<Buckets>> {
    let data_dir = config.data_dir();
    let mut buckets = Buckets::new(&data_dir, config.default_bucket_settings())?;
    if let Some(sink) = event_sink {
        buckets = buckets.with_event_sink(sink);
    }

    let report = buckets.load_all().await?;
    info!(
        "📂 Loaded {} bucket(s) from {}",
        report.loaded.len(),
        data_dir.display()
    );
    for (dir, reason) in &report.failed {
        warn!("⚠️  Skipped bucket directory {}: {}", dir, reason);
    }

    if let Some(name) = config.default_bucket() {
        let bucket = match buckets.get(name).await {
            Some(bucket) => bucket,
            None => {
                info!("🪣 Creating default bucket {}", name);
                buckets.create(name).await?
            }
        };

        if let Some(vb) = bucket.vbucket(0) {
            if vb.state().await == VBState::Dead {
                vb.set_state(VBState::Active).await;
            }
        }
    }

    Ok(Arc::new(buckets))
}
