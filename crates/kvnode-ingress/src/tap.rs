//! Tap streams
//!
//! A TAP_CONNECT turns the connection into a one-way stream of TAP_MUTATION
//! and TAP_DELETE request packets. A producer (a snapshot dump or a live
//! mutation subscription) feeds a bounded packet queue; a transmitter
//! drains it onto the connection's writer. Whichever side fails first ends
//! the stream. A live stream also watches the connection's read half and
//! ends when the client hangs up. Only a completed dump ends gracefully.

use bytes::{Buf, BufMut, BytesMut};
use kvnode_bucket::{Bucket, VBState};
use kvnode_core::events::{MutationEvent, MutationKind};
use kvnode_core::protocol::{Opcode, Request, Response, Status};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// TAP_CONNECT flag: send a snapshot of the bucket, then stop
pub const TAP_FLAG_DUMP: u32 = 0x02;

const TAP_QUEUE_SIZE: usize = 1024;

/// "Forever" in the tap header's TTL slot
const TAP_TTL: u8 = 0xff;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transmitter stopped")]
    TransmitterClosed,

    #[error("Client closed the connection")]
    ClientClosed,

    #[error("Bucket {0} closed the subscription")]
    Unsubscribed(String),
}

enum Ended {
    Producer(Result<(), TapError>),
    Transmitter(Result<(), TapError>),
    ClientClosed,
}

/// Run a tap stream for the session's bucket and return the final response
///
/// `reader` is the connection's read half. A live stream consumes it to
/// notice the client going away; a dump leaves it untouched.
pub async fn run<R, W>(
    bucket: Option<Arc<Bucket>>,
    req: &Request,
    reader: &mut R,
    writer: &mut W,
) -> Response
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let Some(bucket) = bucket else {
        tracing::warn!("TAP_CONNECT without a selected bucket");
        return Response::fatal();
    };

    let flags = match req.extras.len() {
        0 => 0,
        4 => (&req.extras[..]).get_u32(),
        n => {
            tracing::warn!("TAP_CONNECT with {} bytes of extras", n);
            return Response {
                status: Status::InvalidArgument,
                fatal: true,
                ..Default::default()
            };
        }
    };
    let dump = flags & TAP_FLAG_DUMP != 0;

    tracing::info!(
        "Tap stream started on bucket {} ({})",
        bucket.name(),
        if dump { "dump" } else { "live" }
    );

    let (packets_tx, packets_rx) = mpsc::channel(TAP_QUEUE_SIZE);
    let producer = async {
        if dump {
            produce_dump(&bucket, packets_tx).await
        } else {
            produce_live(&bucket, packets_tx).await
        }
    };
    let transmitter = transmit(packets_rx, writer);
    let hangup = async {
        if dump {
            std::future::pending::<()>().await
        } else {
            client_closed(reader).await
        }
    };
    tokio::pin!(producer, transmitter, hangup);

    // Producer first: once it is done the transmitter only has to drain
    let ended = tokio::select! {
        biased;
        res = &mut producer => Ended::Producer(res),
        res = &mut transmitter => Ended::Transmitter(res),
        () = &mut hangup => Ended::ClientClosed,
    };
    let outcome = match ended {
        Ended::Producer(Ok(())) => transmitter.await,
        Ended::Producer(Err(e)) => Err(e),
        Ended::Transmitter(res) => res.and(Err(TapError::TransmitterClosed)),
        Ended::ClientClosed => Err(TapError::ClientClosed),
    };

    match outcome {
        Ok(()) => {
            tracing::info!("Tap stream on bucket {} completed", bucket.name());
            Response::ok()
        }
        Err(e) => {
            tracing::info!("Tap stream on bucket {} ended: {}", bucket.name(), e);
            Response::fatal()
        }
    }
}

/// Queue every item of every Active partition
async fn produce_dump(bucket: &Bucket, packets: mpsc::Sender<Request>) -> Result<(), TapError> {
    for vb in bucket.vbuckets() {
        let Some(guard) = vb.gate(VBState::Active).await else {
            continue;
        };
        let items = guard.snapshot();
        drop(guard);

        for item in items {
            let packet = mutation_packet(
                vb.id(),
                &item.key,
                &item.value,
                item.flags,
                item.expiration,
                item.cas,
            );
            packets
                .send(packet)
                .await
                .map_err(|_| TapError::TransmitterClosed)?;
        }
    }
    Ok(())
}

/// Queue a packet for every mutation until the bucket drops the subscription
async fn produce_live(bucket: &Bucket, packets: mpsc::Sender<Request>) -> Result<(), TapError> {
    let (events_tx, mut events_rx) = mpsc::channel(TAP_QUEUE_SIZE);
    bucket.subscribe(events_tx);

    while let Some(event) = events_rx.recv().await {
        packets
            .send(event_packet(&event))
            .await
            .map_err(|_| TapError::TransmitterClosed)?;
    }
    Err(TapError::Unsubscribed(bucket.name().to_string()))
}

/// Resolve once the client hangs up or its half of the connection fails
///
/// Whatever the client sends while the stream runs is discarded.
async fn client_closed<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => tracing::debug!("Discarding {} bytes sent during a tap stream", n),
            Err(e) => {
                tracing::debug!("Tap client read failed: {}", e);
                return;
            }
        }
    }
}

async fn transmit<W>(mut packets: mpsc::Receiver<Request>, writer: &mut W) -> Result<(), TapError>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(packet) = packets.recv().await {
        writer.write_all(&packet.encode()).await?;
        if packets.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

pub fn event_packet(event: &MutationEvent) -> Request {
    match event.kind {
        MutationKind::Set => mutation_packet(
            event.vbucket,
            &event.key,
            &event.value,
            event.flags,
            event.expiration,
            event.cas,
        ),
        MutationKind::Delete => {
            let mut extras = BytesMut::with_capacity(8);
            put_tap_header(&mut extras);
            Request::new(Opcode::TapDelete)
                .with_vbucket(event.vbucket)
                .with_extras(extras.freeze())
                .with_key(event.key.clone())
                .with_cas(event.cas)
        }
    }
}

fn mutation_packet(
    vbucket: u16,
    key: &[u8],
    value: &[u8],
    flags: u32,
    expiration: u32,
    cas: u64,
) -> Request {
    let mut extras = BytesMut::with_capacity(16);
    put_tap_header(&mut extras);
    extras.put_u32(flags);
    extras.put_u32(expiration);

    Request::new(Opcode::TapMutation)
        .with_vbucket(vbucket)
        .with_extras(extras.freeze())
        .with_key(key.to_vec())
        .with_body(value.to_vec())
        .with_cas(cas)
}

/// Engine-private length, tap flags, TTL, three reserved bytes
fn put_tap_header(buf: &mut BytesMut) {
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u8(TAP_TTL);
    buf.put_bytes(0, 3);
}
