//! Binary request/response protocol
//!
//! Frames use the memcached binary layout: a fixed 24-byte header followed by
//! extras, key and value. Requests carry magic `0x80` and a vbucket id in the
//! header; responses carry magic `0x81` and a status in the same slot.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

/// Upper bound on the body of a single frame
pub const MAX_BODY_LEN: usize = 20 * 1024 * 1024;

/// Protocol opcodes understood by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Opcode {
    Get,
    Set,
    Add,
    Replace,
    Delete,
    Increment,
    Decrement,
    Quit,
    #[default]
    Noop,
    Version,
    GetK,
    Append,
    Prepend,
    Stat,
    SaslListMechs,
    SaslAuth,
    SetVBucket,
    GetVBucket,
    TapConnect,
    TapMutation,
    TapDelete,
    Unknown(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x3d => Opcode::SetVBucket,
            0x3e => Opcode::GetVBucket,
            0x40 => Opcode::TapConnect,
            0x41 => Opcode::TapMutation,
            0x42 => Opcode::TapDelete,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Get => 0x00,
            Opcode::Set => 0x01,
            Opcode::Add => 0x02,
            Opcode::Replace => 0x03,
            Opcode::Delete => 0x04,
            Opcode::Increment => 0x05,
            Opcode::Decrement => 0x06,
            Opcode::Quit => 0x07,
            Opcode::Noop => 0x0a,
            Opcode::Version => 0x0b,
            Opcode::GetK => 0x0c,
            Opcode::Append => 0x0e,
            Opcode::Prepend => 0x0f,
            Opcode::Stat => 0x10,
            Opcode::SaslListMechs => 0x20,
            Opcode::SaslAuth => 0x21,
            Opcode::SetVBucket => 0x3d,
            Opcode::GetVBucket => 0x3e,
            Opcode::TapConnect => 0x40,
            Opcode::TapMutation => 0x41,
            Opcode::TapDelete => 0x42,
            Opcode::Unknown(other) => other,
        }
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Success,
    KeyNotFound,
    KeyExists,
    InvalidArgument,
    NotStored,
    DeltaBadValue,
    NotMyVBucket,
    AuthError,
    UnknownCommand,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x04 => Status::InvalidArgument,
            0x05 => Status::NotStored,
            0x06 => Status::DeltaBadValue,
            0x07 => Status::NotMyVBucket,
            0x20 => Status::AuthError,
            0x81 => Status::UnknownCommand,
            other => Status::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::InvalidArgument => 0x04,
            Status::NotStored => 0x05,
            Status::DeltaBadValue => 0x06,
            Status::NotMyVBucket => 0x07,
            Status::AuthError => 0x20,
            Status::UnknownCommand => 0x81,
            Status::Unknown(other) => other,
        }
    }
}

/// A raw protocol frame, either direction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub magic: u8,
    pub opcode: Opcode,
    pub datatype: u8,
    /// vbucket id for requests, status for responses
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
}

impl Frame {
    /// Encode header and payload into a single buffer
    pub fn encode(&self) -> Bytes {
        let total = self.extras.len() + self.key.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + total);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode.as_u8());
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket_or_status);
        buf.put_u32(total as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// A decoded request record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub opcode: Opcode,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub datatype: u8,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            magic: REQ_MAGIC,
            opcode: self.opcode,
            datatype: self.datatype,
            vbucket_or_status: self.vbucket,
            opaque: self.opaque,
            cas: self.cas,
            extras: self.extras.clone(),
            key: self.key.clone(),
            body: self.body.clone(),
        }
    }

    pub fn encode(&self) -> Bytes {
        self.to_frame().encode()
    }

    fn from_frame(frame: Frame) -> Self {
        Self {
            opcode: frame.opcode,
            vbucket: frame.vbucket_or_status,
            opaque: frame.opaque,
            cas: frame.cas,
            datatype: frame.datatype,
            extras: frame.extras,
            key: frame.key,
            body: frame.body,
        }
    }
}

/// A response record produced by a handler
///
/// `fatal` never reaches the wire; it tells the transport to close the
/// connection once the response has been written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: Status,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
    pub fatal: bool,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// A response that closes the connection after it is sent
    pub fn fatal() -> Self {
        Self {
            fatal: true,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Encode as a reply to a request with the given opcode and opaque
    pub fn encode(&self, opcode: Opcode, opaque: u32) -> Bytes {
        Frame {
            magic: RES_MAGIC,
            opcode,
            datatype: 0,
            vbucket_or_status: self.status.as_u16(),
            opaque,
            cas: self.cas,
            extras: self.extras.clone(),
            key: self.key.clone(),
            body: self.body.clone(),
        }
        .encode()
    }

    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            status: Status::from_u16(frame.vbucket_or_status),
            cas: frame.cas,
            extras: frame.extras.clone(),
            key: frame.key.clone(),
            body: frame.body.clone(),
            fatal: false,
        }
    }
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol(format!(
                "connection closed after {} header bytes",
                filled
            )));
        }
        filled += n;
    }

    let mut hdr = &header[..];
    let magic = hdr.get_u8();
    if magic != REQ_MAGIC && magic != RES_MAGIC {
        return Err(Error::Protocol(format!("bad magic: 0x{:02x}", magic)));
    }
    let opcode = Opcode::from_u8(hdr.get_u8());
    let key_len = hdr.get_u16() as usize;
    let extras_len = hdr.get_u8() as usize;
    let datatype = hdr.get_u8();
    let vbucket_or_status = hdr.get_u16();
    let body_len = hdr.get_u32() as usize;
    let opaque = hdr.get_u32();
    let cas = hdr.get_u64();

    if body_len > MAX_BODY_LEN {
        return Err(Error::FrameTooLarge(body_len));
    }
    if key_len + extras_len > body_len {
        return Err(Error::Protocol(format!(
            "key ({}) and extras ({}) exceed body length {}",
            key_len, extras_len, body_len
        )));
    }

    let mut payload = BytesMut::zeroed(body_len);
    reader.read_exact(&mut payload).await?;
    let mut payload = payload.freeze();
    let extras = payload.split_to(extras_len);
    let key = payload.split_to(key_len);

    Ok(Some(Frame {
        magic,
        opcode,
        datatype,
        vbucket_or_status,
        opaque,
        cas,
        extras,
        key,
        body: payload,
    }))
}

/// Read one request frame; response frames are a protocol error
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) if frame.magic == REQ_MAGIC => Ok(Some(Request::from_frame(frame))),
        Some(frame) => Err(Error::Protocol(format!(
            "expected request magic, got 0x{:02x}",
            frame.magic
        ))),
        None => Ok(None),
    }
}

/// Write a response to a request
pub async fn write_response<W>(writer: &mut W, req: &Request, res: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&res.encode(req.opcode, req.opaque)).await?;
    Ok(())
}
