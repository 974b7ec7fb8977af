//! Common test utilities for integration tests

use kvnode_bucket::{Buckets, VBState};
use kvnode_core::protocol::{Frame, Opcode, Request, Response, read_frame};
use kvnode_ingress::Listener;
use kvnode_storage::BucketSettings;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A listener serving a registry rooted in a directory
#[allow(dead_code)]
pub struct TestNode {
    pub buckets: Arc<Buckets>,
    pub addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
}

#[allow(dead_code)]
impl TestNode {
    /// Node with a single-partition `default` bucket, partition 0 Active
    pub async fn start(dir: &TempDir) -> Self {
        Self::start_in(dir.path(), BucketSettings::default()).await
    }

    /// Load whatever buckets `root` holds, then serve them
    pub async fn start_in(root: &Path, defaults: BucketSettings) -> Self {
        let buckets = Buckets::new(root, defaults).unwrap();
        buckets.load_all().await.unwrap();
        let bucket = match buckets.get("default").await {
            Some(bucket) => bucket,
            None => buckets.create("default").await.unwrap(),
        };
        bucket.set_vbucket_state(0, VBState::Active).await.unwrap();

        let buckets = Arc::new(buckets);
        let listener = Listener::bind("127.0.0.1:0", buckets.clone(), Some("default".to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(listener.serve(async move {
            let _ = stop_rx.await;
        }));

        Self {
            buckets,
            addr,
            stop,
            handle,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
            opaque: 0,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

/// Minimal binary-protocol client
pub struct TestClient {
    stream: TcpStream,
    opaque: u32,
}

#[allow(dead_code)]
impl TestClient {
    /// Send a request without waiting; returns the opaque it was tagged with
    pub async fn send(&mut self, req: Request) -> u32 {
        self.opaque += 1;
        let req = req.with_opaque(self.opaque);
        self.stream.write_all(&req.encode()).await.unwrap();
        self.opaque
    }

    /// Next frame, or `None` once the server closed the connection
    pub async fn recv(&mut self) -> Option<Frame> {
        read_frame(&mut self.stream).await.unwrap()
    }

    pub async fn call(&mut self, req: Request) -> Response {
        let opcode = req.opcode;
        let opaque = self.send(req).await;
        let frame = self.recv().await.expect("connection closed");
        assert_eq!(frame.opcode, opcode);
        assert_eq!(frame.opaque, opaque);
        Response::from_frame(&frame)
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Response {
        self.call(
            Request::new(Opcode::Set)
                .with_key(key.to_string())
                .with_extras(vec![0u8; 8])
                .with_body(value.to_string()),
        )
        .await
    }

    pub async fn get(&mut self, key: &str) -> Response {
        self.call(Request::new(Opcode::Get).with_key(key.to_string()))
            .await
    }

    pub async fn auth(&mut self, body: &[u8]) -> Response {
        self.call(
            Request::new(Opcode::SaslAuth)
                .with_key("PLAIN")
                .with_body(body.to_vec()),
        )
        .await
    }

    pub async fn set_vbucket(&mut self, vbucket: u16, state: VBState) -> Response {
        self.call(
            Request::new(Opcode::SetVBucket)
                .with_vbucket(vbucket)
                .with_extras(state.as_u32().to_be_bytes().to_vec()),
        )
        .await
    }

    /// Stats of a group, up to the terminator
    pub async fn stats(&mut self, group: &str) -> Vec<(String, String)> {
        self.send(Request::new(Opcode::Stat).with_key(group.to_string()))
            .await;
        let mut stats = Vec::new();
        loop {
            let frame = self.recv().await.expect("connection closed");
            if frame.key.is_empty() && frame.body.is_empty() {
                return stats;
            }
            stats.push((
                String::from_utf8(frame.key.to_vec()).unwrap(),
                String::from_utf8(frame.body.to_vec()).unwrap(),
            ));
        }
    }
}
