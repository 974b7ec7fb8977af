//! Key to partition routing
//!
//! The partition hash is the one used across the memcached/Couchbase
//! vbucket ecosystem: bits 16..31 of the key's CRC-32, masked to 15 bits,
//! modulo the partition count. Peers hash keys the same way, so this must
//! not change.

use crate::bucket::Bucket;
use crate::vbucket::{VBState, VBucket, VBucketGuard};
use kvnode_core::protocol::{Opcode, Request, Response};

/// Partition id owning `key` in a bucket with `num_partitions` partitions
pub fn vbucket_id_for_key(key: &[u8], num_partitions: u32) -> u16 {
    let hash = crc32fast::hash(key);
    (((hash >> 16) & 0x7fff) % num_partitions.max(1)) as u16
}

/// Partition owning `key`, whatever its state
pub fn resolve<'a>(bucket: &'a Bucket, key: &[u8]) -> Option<&'a VBucket> {
    bucket.vbucket(vbucket_id_for_key(key, bucket.num_partitions()))
}

/// Partition owning `key`, only if it is in `required` state
///
/// The returned guard keeps the partition's state lock shared until dropped,
/// so a state transition waits for whatever the caller does with it.
pub async fn resolve_in_state<'a>(
    bucket: &'a Bucket,
    key: &[u8],
    required: VBState,
) -> Option<VBucketGuard<'a>> {
    match resolve(bucket, key) {
        Some(vb) => vb.gate(required).await,
        None => None,
    }
}

/// Read `key` from its partition if that partition is in `required` state
pub async fn get_item(bucket: &Bucket, key: &[u8], required: VBState) -> Option<Response> {
    let guard = resolve_in_state(bucket, key, required).await?;
    let req = Request::new(Opcode::Get)
        .with_key(key.to_vec())
        .with_vbucket(guard.id());
    Some(guard.dispatch(&req))
}

/// Store `value` under `key` if its partition is in `required` state
pub async fn set_item(
    bucket: &Bucket,
    key: &[u8],
    value: &[u8],
    required: VBState,
) -> Option<Response> {
    let guard = resolve_in_state(bucket, key, required).await?;
    let req = Request::new(Opcode::Set)
        .with_key(key.to_vec())
        .with_extras(vec![0u8; 8])
        .with_body(value.to_vec())
        .with_vbucket(guard.id());
    Some(guard.dispatch(&req))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::Buckets;
    use kvnode_core::protocol::Status;
    use kvnode_storage::BucketSettings;
    use tempfile::TempDir;

    #[test]
    fn test_hash_matches_known_assignments() {
        // crc32("a") = 0xe8b7be43 -> (0xe8b7 & 0x7fff) = 0x68b7
        assert_eq!(vbucket_id_for_key(b"a", 1024), (0x68b7 % 1024) as u16);
        assert_eq!(vbucket_id_for_key(b"", 1024), 0);
        assert_eq!(vbucket_id_for_key(b"anything", 1), 0);
    }

    #[test]
    fn test_hash_is_stable() {
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert_eq!(
                vbucket_id_for_key(key.as_bytes(), 64),
                vbucket_id_for_key(key.as_bytes(), 64)
            );
        }
    }

    #[test]
    fn test_hash_spreads_keys() {
        let partitions = 16u32;
        let keys = 16_000;
        let mut counts = vec![0usize; partitions as usize];
        for i in 0..keys {
            let key = format!("user:{}:profile", i);
            let id = vbucket_id_for_key(key.as_bytes(), partitions);
            assert!((id as u32) < partitions);
            counts[id as usize] += 1;
        }

        let expected = keys / partitions as usize;
        for count in counts {
            assert!(
                count > expected * 3 / 4 && count < expected * 5 / 4,
                "uneven spread: {} vs {}",
                count,
                expected
            );
        }
    }

    async fn bucket_with(partitions: u32) -> (TempDir, Buckets) {
        let temp_dir = TempDir::new().unwrap();
        let buckets = Buckets::new(temp_dir.path(), BucketSettings::default()).unwrap();
        let settings = BucketSettings {
            num_partitions: partitions,
            ..Default::default()
        };
        buckets
            .create_with_settings("default", settings)
            .await
            .unwrap();
        (temp_dir, buckets)
    }

    #[tokio::test]
    async fn test_resolve_in_state_gates_on_state() {
        let (_dir, buckets) = bucket_with(4).await;
        let bucket = buckets.get("default").await.unwrap();
        let id = vbucket_id_for_key(b"a", 4);

        assert_eq!(resolve(&bucket, b"a").unwrap().id(), id);
        assert!(resolve_in_state(&bucket, b"a", VBState::Active).await.is_none());

        bucket.set_vbucket_state(id, VBState::Active).await.unwrap();
        let guard = resolve_in_state(&bucket, b"a", VBState::Active).await.unwrap();
        assert_eq!(guard.id(), id);
        assert!(resolve_in_state(&bucket, b"a", VBState::Replica).await.is_none());
    }

    #[tokio::test]
    async fn test_get_and_set_item() {
        let (_dir, buckets) = bucket_with(1).await;
        let bucket = buckets.get("default").await.unwrap();

        assert!(set_item(&bucket, b"a", b"1", VBState::Active).await.is_none());

        bucket.set_vbucket_state(0, VBState::Active).await.unwrap();
        let res = set_item(&bucket, b"a", b"1", VBState::Active).await.unwrap();
        assert_eq!(res.status, Status::Success);

        let res = get_item(&bucket, b"a", VBState::Active).await.unwrap();
        assert_eq!(&res.body[..], b"1");

        let res = get_item(&bucket, b"b", VBState::Active).await.unwrap();
        assert_eq!(res.status, Status::KeyNotFound);

        bucket.set_vbucket_state(0, VBState::Dead).await.unwrap();
        assert!(get_item(&bucket, b"a", VBState::Active).await.is_none());
    }
}
