//! STAT streaming
//!
//! Each stat is written as its own response (key = name, body = value)
//! ahead of the empty terminator the caller sends.

use kvnode_bucket::{Bucket, VBState};
use kvnode_core::protocol::{Request, Response, write_response};
use tokio::io::AsyncWrite;

/// Stat group for per-partition states
pub const GROUP_VBUCKET: &[u8] = b"vbucket";

/// Write the requested stat group and return the terminator
///
/// Unknown groups and sessions without a bucket get the terminator alone.
/// A write failure turns the terminator into a fatal response.
pub async fn write_stats<W>(bucket: Option<&Bucket>, req: &Request, writer: &mut W) -> Response
where
    W: AsyncWrite + Unpin + Send,
{
    let Some(bucket) = bucket else {
        return Response::ok();
    };

    let stats = match &req.key[..] {
        b"" => general_stats(bucket).await,
        GROUP_VBUCKET => vbucket_stats(bucket).await,
        other => {
            tracing::debug!("Unknown stat group {:?}", String::from_utf8_lossy(other));
            Vec::new()
        }
    };

    for (name, value) in stats {
        let res = Response::ok().with_key(name).with_body(value);
        if let Err(e) = write_response(writer, req, &res).await {
            tracing::warn!("Failed to write stats for bucket {}: {}", bucket.name(), e);
            return Response::fatal();
        }
    }

    Response::ok()
}

async fn general_stats(bucket: &Bucket) -> Vec<(String, String)> {
    let counts = bucket.vbucket_state_counts().await;

    let mut stats = vec![
        ("bucket".to_string(), bucket.name().to_string()),
        (
            "num_partitions".to_string(),
            bucket.num_partitions().to_string(),
        ),
        ("curr_items".to_string(), bucket.item_count().to_string()),
    ];
    for (state, count) in VBState::ALL.iter().zip(counts) {
        stats.push((format!("vb_{}_num", state), count.to_string()));
    }
    for (name, value) in bucket.stats().snapshot() {
        stats.push((name.to_string(), value.to_string()));
    }
    stats
}

async fn vbucket_stats(bucket: &Bucket) -> Vec<(String, String)> {
    let mut stats = Vec::with_capacity(bucket.vbuckets().len());
    for vb in bucket.vbuckets() {
        stats.push((format!("vb_{}", vb.id()), vb.state().await.to_string()));
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvnode_bucket::Buckets;
    use kvnode_core::protocol::{Opcode, Status, read_frame};
    use kvnode_storage::BucketSettings;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn collect(bytes: &[u8]) -> HashMap<String, String> {
        let mut reader = bytes;
        let mut stats = HashMap::new();
        while let Some(frame) = read_frame(&mut reader).await.unwrap() {
            assert_eq!(frame.opcode, Opcode::Stat);
            stats.insert(
                String::from_utf8(frame.key.to_vec()).unwrap(),
                String::from_utf8(frame.body.to_vec()).unwrap(),
            );
        }
        stats
    }

    async fn bucket(temp_dir: &TempDir) -> std::sync::Arc<Bucket> {
        let buckets = Buckets::new(temp_dir.path(), BucketSettings::default()).unwrap();
        let settings = BucketSettings {
            num_partitions: 4,
            ..Default::default()
        };
        let bucket = buckets.create_with_settings("default", settings).await.unwrap();
        bucket.set_vbucket_state(0, VBState::Active).await.unwrap();
        bucket.set_vbucket_state(1, VBState::Replica).await.unwrap();
        bucket
    }

    #[tokio::test]
    async fn test_general_stats() {
        let temp_dir = TempDir::new().unwrap();
        let bucket = bucket(&temp_dir).await;
        let req = Request::new(Opcode::Get).with_key("a");
        bucket.vbucket(0).unwrap().dispatch(&req).await;

        let mut out = Vec::new();
        let res = write_stats(Some(&*bucket), &Request::new(Opcode::Stat), &mut out).await;
        assert_eq!(res, Response::ok());

        let stats = collect(&out).await;
        assert_eq!(stats["bucket"], "default");
        assert_eq!(stats["num_partitions"], "4");
        assert_eq!(stats["curr_items"], "0");
        assert_eq!(stats["vb_active_num"], "1");
        assert_eq!(stats["vb_replica_num"], "1");
        assert_eq!(stats["vb_pending_num"], "0");
        assert_eq!(stats["vb_dead_num"], "2");
        assert_eq!(stats["cmd_get"], "1");
        assert_eq!(stats["get_misses"], "1");
    }

    #[tokio::test]
    async fn test_vbucket_stats() {
        let temp_dir = TempDir::new().unwrap();
        let bucket = bucket(&temp_dir).await;

        let mut out = Vec::new();
        let req = Request::new(Opcode::Stat).with_key("vbucket");
        write_stats(Some(&*bucket), &req, &mut out).await;

        let stats = collect(&out).await;
        assert_eq!(stats.len(), 4);
        assert_eq!(stats["vb_0"], "active");
        assert_eq!(stats["vb_1"], "replica");
        assert_eq!(stats["vb_3"], "dead");
    }

    #[tokio::test]
    async fn test_unknown_group_and_no_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let bucket = bucket(&temp_dir).await;

        let mut out = Vec::new();
        let req = Request::new(Opcode::Stat).with_key("nonsense");
        let res = write_stats(Some(&*bucket), &req, &mut out).await;
        assert_eq!(res.status, Status::Success);
        assert!(out.is_empty());

        let res = write_stats(None, &Request::new(Opcode::Stat), &mut out).await;
        assert_eq!(res, Response::ok());
        assert!(out.is_empty());
    }
}
