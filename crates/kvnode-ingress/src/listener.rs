//! TCP listener
//!
//! Accepts connections and runs one [`Session`] task per connection, each
//! starting with the configured default bucket selected. Transient accept
//! failures are retried with exponential backoff; anything else stops the
//! listener.

use crate::session::Session;
use kvnode_bucket::Buckets;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::Instrument;
use uuid::Uuid;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

pub struct Listener {
    listener: TcpListener,
    buckets: Arc<Buckets>,
    default_bucket: Option<String>,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        buckets: Arc<Buckets>,
        default_bucket: Option<String>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            buckets,
            default_bucket,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves or accepting fails for good
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Listener on {:?} shutting down", self.local_addr().ok());
                    return Ok(());
                }
                res = self.listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    self.spawn_session(stream, peer).await;
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Accept failed, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
                Err(e) => {
                    tracing::error!("Accept failed, stopping listener: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let current = match &self.default_bucket {
            Some(name) => self.buckets.get(name).await,
            None => None,
        };
        let session = Session::new(self.buckets.clone(), current, peer.to_string());

        let span = tracing::info_span!("session", id = %Uuid::new_v4(), peer = %peer);
        tokio::spawn(
            async move {
                tracing::debug!("Accepted connection");
                if let Err(e) = session.run(stream).await {
                    tracing::debug!("Session ended with error: {}", e);
                }
            }
            .instrument(span),
        );
    }
}

/// Accept errors worth retrying: per-connection failures and fd/memory exhaustion
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    is_fd_exhaustion(e)
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EMFILE | ENFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvnode_bucket::VBState;
    use kvnode_core::protocol::{Opcode, Request, Status, read_frame};
    use kvnode_storage::BucketSettings;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(ENFILE)));
        // EACCES
        assert!(!is_transient(&io::Error::from_raw_os_error(13)));
    }

    #[tokio::test]
    async fn test_serves_default_bucket_until_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let buckets = Arc::new(Buckets::new(temp_dir.path(), BucketSettings::default()).unwrap());
        let bucket = buckets.create("default").await.unwrap();
        bucket.set_vbucket_state(0, VBState::Active).await.unwrap();

        let listener = Listener::bind("127.0.0.1:0", buckets, Some("default".to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.serve(async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = Request::new(Opcode::Set)
            .with_key("a")
            .with_extras(vec![0u8; 8])
            .with_body("1");
        stream.write_all(&req.encode()).await.unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.vbucket_or_status, Status::Success.as_u16());

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_default_bucket_means_no_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let buckets = Arc::new(Buckets::new(temp_dir.path(), BucketSettings::default()).unwrap());

        let listener = Listener::bind("127.0.0.1:0", buckets, Some("missing".to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.serve(std::future::pending()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&Request::new(Opcode::Get).with_key("a").encode())
            .await
            .unwrap();
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.vbucket_or_status, Status::AuthError.as_u16());
    }
}
