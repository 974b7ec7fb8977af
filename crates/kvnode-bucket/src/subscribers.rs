//! Mutation event fan-out

use chrono::Utc;
use kvnode_core::events::{MutationEvent, MutationKind};
use kvnode_storage::{Item, MutationListener};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receiving end of a bucket's mutation events
pub type EventSink = mpsc::Sender<MutationEvent>;

/// The set of sinks subscribed to one bucket
///
/// Publishing never blocks the data path. A sink that is closed, or too far
/// behind to take the next event, is dropped from the set; its receiver sees
/// the channel close instead of a stream with gaps in it.
#[derive(Debug, Default)]
pub struct Subscribers {
    sinks: Mutex<Vec<EventSink>>,
}

impl Subscribers {
    pub fn subscribe(&self, sink: EventSink) {
        match self.sinks.lock() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    pub fn publish(&self, event: &MutationEvent) {
        let mut sinks = match self.sinks.lock() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };

        sinks.retain(|sink| match sink.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Subscriber queue full at {:?} event for key {}, unsubscribing it",
                    event.kind,
                    event.key_lossy()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drop every sink; their receivers see the channel close
    pub fn clear(&self) {
        match self.sinks.lock() {
            Ok(mut sinks) => sinks.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Number of sinks whose receivers are still open
    pub fn len(&self) -> usize {
        let mut sinks = match self.sinks.lock() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks.retain(|sink| !sink.is_closed());
        sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns one partition's store mutations into bucket events
pub struct PartitionPublisher {
    bucket: Arc<str>,
    vbucket: u16,
    subscribers: Arc<Subscribers>,
}

impl PartitionPublisher {
    pub fn new(bucket: Arc<str>, vbucket: u16, subscribers: Arc<Subscribers>) -> Self {
        Self {
            bucket,
            vbucket,
            subscribers,
        }
    }

    fn event(&self, kind: MutationKind, key: &[u8], cas: u64) -> MutationEvent {
        MutationEvent {
            bucket: self.bucket.to_string(),
            vbucket: self.vbucket,
            kind,
            key: key.to_vec(),
            value: Vec::new(),
            flags: 0,
            expiration: 0,
            cas,
            timestamp: Utc::now(),
        }
    }
}

impl MutationListener for PartitionPublisher {
    fn stored(&self, item: &Item) {
        self.subscribers.publish(&MutationEvent {
            value: item.value.clone(),
            flags: item.flags,
            expiration: item.expiration,
            ..self.event(MutationKind::Set, &item.key, item.cas)
        });
    }

    fn deleted(&self, key: &[u8], cas: u64) {
        self.subscribers
            .publish(&self.event(MutationKind::Delete, key, cas));
    }
}
