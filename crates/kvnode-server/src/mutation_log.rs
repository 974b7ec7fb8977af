//! Mutation logger
//!
//! Subscribed to every bucket; logs each mutation at debug level.

use kvnode_bucket::EventSink;
use kvnode_core::events::MutationEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const MUTATION_LOG_BUFFER: usize = 4096;

/// Start the logger task and return the sink to subscribe to buckets
pub fn spawn_mutation_logger() -> (EventSink, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::channel::<MutationEvent>(MUTATION_LOG_BUFFER);

    let handle = tokio::spawn(async move {
        let mut logged = 0u64;
        while let Some(event) = rx.recv().await {
            debug!(
                bucket = %event.bucket,
                vbucket = event.vbucket,
                kind = ?event.kind,
                key = %event.key_lossy(),
                cas = event.cas,
                "mutation"
            );
            logged += 1;
        }
        logged
    });

    (tx, handle)
}
