//! Data operations over TCP

mod common;

use bytes::BufMut;
use common::TestNode;
use futures::future::join_all;
use kvnode_bucket::VBState;
use kvnode_core::protocol::{Opcode, Request, Status};
use tempfile::TempDir;

#[tokio::test]
async fn test_set_then_get() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    let res = client.set("a", "1").await;
    assert_eq!(res.status, Status::Success);
    assert!(res.cas > 0);

    let res = client.get("a").await;
    assert_eq!(res.status, Status::Success);
    assert_eq!(&res.body[..], b"1");
    assert_eq!(res.cas, client.get("a").await.cas);

    node.shutdown().await;
}

#[tokio::test]
async fn test_dead_partition_is_not_my_vbucket() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    client.set("a", "1").await;
    assert_eq!(
        client.set_vbucket(0, VBState::Dead).await.status,
        Status::Success
    );

    let res = client.get("a").await;
    assert_eq!(res.status, Status::NotMyVBucket);
    assert!(res.body.is_empty());

    // The data is still there once the partition comes back
    client.set_vbucket(0, VBState::Active).await;
    assert_eq!(&client.get("a").await.body[..], b"1");
}

#[tokio::test]
async fn test_replica_partition_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    client.set_vbucket(0, VBState::Replica).await;
    assert_eq!(client.set("a", "1").await.status, Status::NotMyVBucket);
}

#[tokio::test]
async fn test_unknown_partition_is_not_my_vbucket() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    let res = client
        .call(Request::new(Opcode::Get).with_key("a").with_vbucket(99))
        .await;
    assert_eq!(res.status, Status::NotMyVBucket);
}

#[tokio::test]
async fn test_store_modes_and_cas() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    let add = |key: &str| {
        Request::new(Opcode::Add)
            .with_key(key.to_string())
            .with_extras(vec![0u8; 8])
            .with_body("x")
    };
    assert_eq!(client.call(add("k")).await.status, Status::Success);
    assert_eq!(client.call(add("k")).await.status, Status::KeyExists);

    let cas = client.get("k").await.cas;
    let stale = Request::new(Opcode::Set)
        .with_key("k")
        .with_extras(vec![0u8; 8])
        .with_body("y")
        .with_cas(cas + 1);
    assert_eq!(client.call(stale).await.status, Status::KeyExists);

    let prepend = Request::new(Opcode::Prepend).with_key("k").with_body(">");
    assert_eq!(client.call(prepend).await.status, Status::Success);
    assert_eq!(&client.get("k").await.body[..], b">x");

    let delete = Request::new(Opcode::Delete).with_key("k");
    assert_eq!(client.call(delete.clone()).await.status, Status::Success);
    assert_eq!(client.call(delete).await.status, Status::KeyNotFound);
}

#[tokio::test]
async fn test_counters() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    let incr = |delta: u64, initial: u64| {
        let mut extras = Vec::with_capacity(20);
        extras.put_u64(delta);
        extras.put_u64(initial);
        extras.put_u32(0);
        Request::new(Opcode::Increment)
            .with_key("hits")
            .with_extras(extras)
    };

    let res = client.call(incr(1, 100)).await;
    assert_eq!(&res.body[..], &100u64.to_be_bytes());
    let res = client.call(incr(5, 100)).await;
    assert_eq!(&res.body[..], &105u64.to_be_bytes());
    assert_eq!(&client.get("hits").await.body[..], b"105");
}

#[tokio::test]
async fn test_pipelined_requests_answer_in_order() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    let mut sent = Vec::new();
    for i in 0..20 {
        let req = Request::new(Opcode::Set)
            .with_key(format!("key-{}", i))
            .with_extras(vec![0u8; 8])
            .with_body(format!("{}", i));
        sent.push(client.send(req).await);
    }
    for opaque in sent {
        let frame = client.recv().await.unwrap();
        assert_eq!(frame.opaque, opaque);
    }
    assert_eq!(&client.get("key-7").await.body[..], b"7");
}

#[tokio::test]
async fn test_clients_share_bucket_data() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;

    let mut handles = Vec::new();
    for c in 0..4 {
        let mut client = node.connect().await;
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let res = client.set(&format!("c{}-{}", c, i), "v").await;
                assert_eq!(res.status, Status::Success);
            }
        }));
    }
    for res in join_all(handles).await {
        res.unwrap();
    }

    let mut reader = node.connect().await;
    assert_eq!(&reader.get("c3-24").await.body[..], b"v");
    let bucket = node.buckets.get("default").await.unwrap();
    assert_eq!(bucket.item_count(), 100);
}

#[tokio::test]
async fn test_stats() {
    let dir = TempDir::new().unwrap();
    let node = TestNode::start(&dir).await;
    let mut client = node.connect().await;

    client.set("a", "1").await;
    client.get("a").await;
    client.get("missing").await;

    let stats = client.stats("").await;
    let stat = |name: &str| {
        stats
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(stat("bucket"), "default");
    assert_eq!(stat("curr_items"), "1");
    assert_eq!(stat("get_hits"), "1");
    assert_eq!(stat("get_misses"), "1");
    assert_eq!(stat("vb_active_num"), "1");

    let stats = client.stats("vbucket").await;
    assert_eq!(stats, vec![("vb_0".to_string(), "active".to_string())]);

    assert!(client.stats("bogus").await.is_empty());
}
