//! Per-bucket operation counters

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BucketStats {
    pub cmd_get: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub cmd_set: AtomicU64,
    pub delete_hits: AtomicU64,
    pub delete_misses: AtomicU64,
    pub not_my_vbucket: AtomicU64,
}

impl BucketStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values by stat name
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("cmd_get", load(&self.cmd_get)),
            ("get_hits", load(&self.get_hits)),
            ("get_misses", load(&self.get_misses)),
            ("cmd_set", load(&self.cmd_set)),
            ("delete_hits", load(&self.delete_hits)),
            ("delete_misses", load(&self.delete_misses)),
            ("not_my_vbucket", load(&self.not_my_vbucket)),
        ]
    }
}
