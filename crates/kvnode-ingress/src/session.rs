//! Per-connection protocol session
//!
//! A session starts with the listener's default bucket selected (or none)
//! and switches buckets only on a successful SASL PLAIN exchange. Every
//! request gets exactly one final response; STAT and TAP_CONNECT write
//! their intermediate packets straight to the connection first. A fatal
//! response is written and then the connection is closed.

use crate::{stats, tap};
use bytes::Buf;
use kvnode_bucket::stats::BucketStats;
use kvnode_bucket::{Bucket, Buckets, VBState};
use kvnode_core::Result;
use kvnode_core::protocol::{Opcode, Request, Response, Status, read_request, write_response};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The only SASL mechanism offered
pub const SASL_MECH_PLAIN: &str = "PLAIN";

pub struct Session {
    buckets: Arc<Buckets>,
    current: Option<Arc<Bucket>>,
    remote_addr: String,
}

impl Session {
    pub fn new(
        buckets: Arc<Buckets>,
        current: Option<Arc<Bucket>>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            buckets,
            current,
            remote_addr: remote_addr.into(),
        }
    }

    pub fn current_bucket(&self) -> Option<&Arc<Bucket>> {
        self.current.as_ref()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Serve requests until the peer disconnects or a fatal response is sent
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        tracing::debug!("Session started for {}", self.remote_addr);

        loop {
            let Some(req) = read_request(&mut reader).await? else {
                tracing::debug!("Client {} closed the connection", self.remote_addr);
                return Ok(());
            };

            let res = self.dispatch(&req, &mut reader, &mut writer).await;
            write_response(&mut writer, &req, &res).await?;

            if res.fatal {
                tracing::debug!(
                    "Closing connection to {} after fatal {:?} response",
                    self.remote_addr,
                    req.opcode
                );
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }

    /// Handle one request and return its final response
    ///
    /// Only TAP_CONNECT touches `reader`, to watch for the client hanging up.
    pub async fn dispatch<R, W>(
        &mut self,
        req: &Request,
        reader: &mut R,
        writer: &mut W,
    ) -> Response
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        tracing::debug!(
            "Request {:?} vbucket={} key_len={} body_len={}",
            req.opcode,
            req.vbucket,
            req.key.len(),
            req.body.len()
        );

        match req.opcode {
            Opcode::Quit => Response::fatal(),
            Opcode::Version => Response::ok().with_body(VERSION),
            Opcode::Noop => Response::ok(),
            Opcode::SaslListMechs => sasl_list_mechs(req),
            Opcode::SaslAuth => self.sasl_auth(req).await,
            Opcode::SetVBucket => self.set_vbucket(req).await,
            Opcode::GetVBucket => self.get_vbucket(req).await,
            Opcode::TapConnect => tap::run(self.current.clone(), req, reader, writer).await,
            Opcode::Stat => stats::write_stats(self.current.as_deref(), req, writer).await,
            _ => self.data(req).await,
        }
    }

    async fn sasl_auth(&mut self, req: &Request) -> Response {
        if req.vbucket != 0 || req.cas != 0 || !req.extras.is_empty() || req.body.len() < 2 {
            return Response::status(Status::InvalidArgument);
        }

        let mech = String::from_utf8_lossy(&req.key);
        if mech != SASL_MECH_PLAIN {
            return Response::status(Status::InvalidArgument)
                .with_body(format!("unsupported SASL auth mech: {}", mech));
        }

        let fields: Vec<&[u8]> = req.body.split(|b| *b == 0).collect();
        let [_authzid, name, secret] = fields[..] else {
            return Response::status(Status::InvalidArgument).with_body("invalid SASL auth body");
        };

        let name = String::from_utf8_lossy(name);
        let Some(bucket) = self.buckets.get(&name).await else {
            tracing::debug!("SASL auth from {} for unknown bucket {}", self.remote_addr, name);
            return Response::status(Status::InvalidArgument).with_body("not a bucket");
        };
        if !bucket.auth(secret).await {
            tracing::info!("SASL auth from {} failed for bucket {}", self.remote_addr, name);
            return Response::status(Status::InvalidArgument).with_body("failed auth");
        }

        tracing::info!("{} authenticated to bucket {}", self.remote_addr, name);
        self.current = Some(bucket);
        Response::ok()
    }

    async fn set_vbucket(&self, req: &Request) -> Response {
        let Some(bucket) = &self.current else {
            return Response::status(Status::AuthError);
        };
        if req.extras.len() != 4 {
            return Response::status(Status::InvalidArgument);
        }
        let Some(state) = VBState::from_u32((&req.extras[..]).get_u32()) else {
            return Response::status(Status::InvalidArgument);
        };

        match bucket.set_vbucket_state(req.vbucket, state).await {
            Some(_) => Response::ok(),
            None => not_my_vbucket(bucket),
        }
    }

    async fn get_vbucket(&self, req: &Request) -> Response {
        let Some(bucket) = &self.current else {
            return Response::status(Status::AuthError);
        };
        match bucket.vbucket(req.vbucket) {
            Some(vb) => {
                let state = vb.state().await;
                Response::ok().with_body(state.as_u32().to_be_bytes().to_vec())
            }
            None => not_my_vbucket(bucket),
        }
    }

    /// Route a data opcode to the partition named in the request
    async fn data(&self, req: &Request) -> Response {
        let Some(bucket) = &self.current else {
            return Response::status(Status::AuthError);
        };
        match bucket.vbucket(req.vbucket) {
            Some(vb) => vb.dispatch(req).await,
            None => not_my_vbucket(bucket),
        }
    }
}

fn sasl_list_mechs(req: &Request) -> Response {
    if !req.extras.is_empty()
        || req.vbucket != 0
        || req.cas != 0
        || !req.key.is_empty()
        || !req.body.is_empty()
    {
        return Response::status(Status::InvalidArgument);
    }
    Response::ok().with_body(SASL_MECH_PLAIN)
}

fn not_my_vbucket(bucket: &Bucket) -> Response {
    BucketStats::incr(&bucket.stats().not_my_vbucket);
    Response::status(Status::NotMyVBucket)
}
