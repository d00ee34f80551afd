//! Wire format for the framed transport.
//!
//! Request/reply over a byte stream. One request is outstanding at a time,
//! so frames carry no request ids.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Invocation, Operation, Reply};
use crate::error::{FaultCode, RemoteError, TransportError};
use crate::model::WireObject;

type Result<T> = std::result::Result<T, TransportError>;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Request = 0x02,
    Reply = 0x03,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum OpCode {
    IsA = 0x01,
    CreateSession = 0x02,
    DestroySession = 0x03,
    Close = 0x04,
    GetUpdateService = 0x05,
    CreateRawFileStore = 0x06,
    SaveAndReturnObject = 0x07,
    SetFileId = 0x08,
    Write = 0x09,
}

impl OpCode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::IsA),
            0x02 => Some(Self::CreateSession),
            0x03 => Some(Self::DestroySession),
            0x04 => Some(Self::Close),
            0x05 => Some(Self::GetUpdateService),
            0x06 => Some(Self::CreateRawFileStore),
            0x07 => Some(Self::SaveAndReturnObject),
            0x08 => Some(Self::SetFileId),
            0x09 => Some(Self::Write),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ReplyKind {
    Unit = 0x00,
    Bool = 0x01,
    Proxy = 0x02,
    Object = 0x03,
    Fault = 0x04,
}

impl ReplyKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Unit),
            0x01 => Some(Self::Bool),
            0x02 => Some(Self::Proxy),
            0x03 => Some(Self::Object),
            0x04 => Some(Self::Fault),
            _ => None,
        }
    }
}

fn violation(msg: impl Into<String>) -> TransportError {
    TransportError::Protocol(msg.into())
}

// =============================================================================
// Field helpers
// =============================================================================

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| violation("string longer than 65535 bytes"))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(violation(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(violation(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| violation(format!("Invalid UTF-8 in {}", what)))
}

fn put_object(buf: &mut BytesMut, object: &WireObject) -> Result<()> {
    put_str(buf, &object.type_id)?;
    let json = serde_json::to_vec(&object.fields)
        .map_err(|e| violation(format!("cannot marshal {}: {}", object.type_id, e)))?;
    buf.put_u32(json.len() as u32);
    buf.put_slice(&json);
    Ok(())
}

fn get_object(payload: &mut Bytes) -> Result<WireObject> {
    let type_id = get_str(payload, "object type")?;
    if payload.remaining() < 4 {
        return Err(violation("object length truncated"));
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(violation("object fields truncated"));
    }
    let raw = payload.copy_to_bytes(len);
    let fields = serde_json::from_slice(&raw)
        .map_err(|e| violation(format!("invalid fields for {}: {}", type_id, e)))?;
    Ok(WireObject { type_id, fields })
}

fn need(payload: &Bytes, n: usize, what: &str) -> Result<()> {
    if payload.remaining() < n {
        return Err(violation(format!("{} payload too short", what)));
    }
    Ok(())
}

/// Prefix a payload with the frame header.
fn frame(msg_type: MessageType, payload: BytesMut) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(violation(format!(
            "Frame size {} exceeds maximum allowed size {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
}

impl Hello {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 2);
        buf.put_u32(2);
        buf.put_u8(MessageType::Hello as u8);
        buf.put_u16(self.version);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 2, "Hello")?;
        Ok(Self {
            version: payload.get_u16(),
        })
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// REQUEST (0x02)
// =============================================================================

pub fn encode_request(invocation: &Invocation) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    put_str(&mut buf, &invocation.identity)?;

    match &invocation.operation {
        Operation::IsA { type_id } => {
            buf.put_u8(OpCode::IsA as u8);
            put_str(&mut buf, type_id)?;
        }
        Operation::CreateSession { username, password } => {
            buf.put_u8(OpCode::CreateSession as u8);
            put_str(&mut buf, username)?;
            put_str(&mut buf, password)?;
        }
        Operation::DestroySession => buf.put_u8(OpCode::DestroySession as u8),
        Operation::Close => buf.put_u8(OpCode::Close as u8),
        Operation::GetUpdateService => buf.put_u8(OpCode::GetUpdateService as u8),
        Operation::CreateRawFileStore => buf.put_u8(OpCode::CreateRawFileStore as u8),
        Operation::SaveAndReturnObject { object } => {
            buf.put_u8(OpCode::SaveAndReturnObject as u8);
            put_object(&mut buf, object)?;
        }
        Operation::SetFileId { id } => {
            buf.put_u8(OpCode::SetFileId as u8);
            buf.put_i64(*id);
        }
        Operation::Write { offset, data } => {
            buf.put_u8(OpCode::Write as u8);
            buf.put_u64(*offset);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
    }

    frame(MessageType::Request, buf)
}

pub fn decode_request(mut payload: Bytes) -> Result<Invocation> {
    let identity = get_str(&mut payload, "identity")?;
    need(&payload, 1, "Request")?;
    let code = payload.get_u8();
    let code = OpCode::from_u8(code).ok_or_else(|| violation(format!("Unknown op code {:#04x}", code)))?;

    let operation = match code {
        OpCode::IsA => Operation::IsA {
            type_id: get_str(&mut payload, "type id")?,
        },
        OpCode::CreateSession => Operation::CreateSession {
            username: get_str(&mut payload, "username")?,
            password: get_str(&mut payload, "password")?,
        },
        OpCode::DestroySession => Operation::DestroySession,
        OpCode::Close => Operation::Close,
        OpCode::GetUpdateService => Operation::GetUpdateService,
        OpCode::CreateRawFileStore => Operation::CreateRawFileStore,
        OpCode::SaveAndReturnObject => Operation::SaveAndReturnObject {
            object: get_object(&mut payload)?,
        },
        OpCode::SetFileId => {
            need(&payload, 8, "SetFileId")?;
            Operation::SetFileId {
                id: payload.get_i64(),
            }
        }
        OpCode::Write => {
            need(&payload, 12, "Write")?;
            let offset = payload.get_u64();
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(violation("Write content truncated"));
            }
            Operation::Write {
                offset,
                data: payload.copy_to_bytes(len),
            }
        }
    };

    Ok(Invocation {
        identity,
        operation,
    })
}

// =============================================================================
// REPLY (0x03)
// =============================================================================

pub fn encode_reply(reply: &Reply) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match reply {
        Reply::Unit => buf.put_u8(ReplyKind::Unit as u8),
        Reply::Bool(b) => {
            buf.put_u8(ReplyKind::Bool as u8);
            buf.put_u8(*b as u8);
        }
        Reply::Proxy(identity) => {
            buf.put_u8(ReplyKind::Proxy as u8);
            put_str(&mut buf, identity)?;
        }
        Reply::Object(object) => {
            buf.put_u8(ReplyKind::Object as u8);
            put_object(&mut buf, object)?;
        }
        Reply::Fault(err) => {
            buf.put_u8(ReplyKind::Fault as u8);
            buf.put_u16(err.code() as u16);
            put_str(&mut buf, err.message())?;
        }
    }
    frame(MessageType::Reply, buf)
}

pub fn decode_reply(mut payload: Bytes) -> Result<Reply> {
    need(&payload, 1, "Reply")?;
    let kind = payload.get_u8();
    let kind = ReplyKind::from_u8(kind).ok_or_else(|| violation(format!("Unknown reply kind {:#04x}", kind)))?;

    match kind {
        ReplyKind::Unit => Ok(Reply::Unit),
        ReplyKind::Bool => {
            need(&payload, 1, "Bool reply")?;
            Ok(Reply::Bool(payload.get_u8() != 0))
        }
        ReplyKind::Proxy => Ok(Reply::Proxy(get_str(&mut payload, "proxy identity")?)),
        ReplyKind::Object => Ok(Reply::Object(get_object(&mut payload)?)),
        ReplyKind::Fault => {
            need(&payload, 2, "Fault")?;
            let raw = payload.get_u16();
            let code = FaultCode::from_u16(raw).ok_or_else(|| violation(format!("Unknown fault code {}", raw)))?;
            let message = get_str(&mut payload, "fault message")?;
            Ok(Reply::Fault(RemoteError::from_code(code, message)))
        }
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(violation(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| violation(format!("Unknown message type {:#04x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (peer needs upgrade)
    TooOld { peer: u16, min_supported: u16 },
    /// Version is too new (we need upgrade)
    TooNew { peer: u16, max_supported: u16 },
}

/// Check if a peer protocol version is supported.
pub fn negotiate_version(peer_version: u16) -> VersionNegotiationResult {
    if peer_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            peer: peer_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if peer_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            peer: peer_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(peer_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
