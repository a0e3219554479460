//! Coordinator Wire Protocol
//!
//! Length-prefixed, CRC-checked, bincode-encoded frames exchanged between
//! [`RemoteCoordinator`](super::RemoteCoordinator) and
//! [`CoordinatorServer`](super::CoordinatorServer).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CreateMode, NodeStat, SessionId, WatchedEvent};
use crate::error::{Error, Result};

/// Upper bound on a single frame body
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// A coordinator operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    /// `watch` is the client-side watcher id to notify
    Exists {
        path: String,
        watch: Option<u64>,
    },
    GetChildren {
        path: String,
        watch: Option<u64>,
    },
    GetData {
        path: String,
    },
    Delete {
        path: String,
        version: Option<u32>,
    },
    /// Session keep-alive
    Ping,
    /// Close the session and drop its ephemeral nodes
    Close,
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "Create",
            Request::Exists { .. } => "Exists",
            Request::GetChildren { .. } => "GetChildren",
            Request::GetData { .. } => "GetData",
            Request::Delete { .. } => "Delete",
            Request::Ping => "Ping",
            Request::Close => "Close",
        }
    }
}

/// Result of a [`Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Created(String),
    Stat(Option<NodeStat>),
    Children(Vec<String>),
    Data(Option<(Vec<u8>, NodeStat)>),
    Deleted(bool),
    Pong,
    Closed,
    Error { code: ErrorCode, message: String },
}

/// Error codes for coordinator failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoNode,
    NodeExists,
    BadVersion,
    NotEmpty,
    InvalidPath,
    SessionExpired,
    Internal,
}

impl Reply {
    /// Encode an error for the wire
    pub fn from_error(err: &Error) -> Self {
        let (code, message) = match err {
            Error::NoNode(path) => (ErrorCode::NoNode, path.clone()),
            Error::NodeExists(path) => (ErrorCode::NodeExists, path.clone()),
            Error::BadVersion { path, .. } => (ErrorCode::BadVersion, path.clone()),
            Error::NotEmpty(path) => (ErrorCode::NotEmpty, path.clone()),
            Error::InvalidPath(reason) => (ErrorCode::InvalidPath, reason.clone()),
            Error::SessionExpired(id) => (ErrorCode::SessionExpired, format!("{:#x}", id)),
            other => (ErrorCode::Internal, other.to_string()),
        };
        Reply::Error { code, message }
    }

    /// Get the reply type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Reply::Created(_) => "Created",
            Reply::Stat(_) => "Stat",
            Reply::Children(_) => "Children",
            Reply::Data(_) => "Data",
            Reply::Deleted(_) => "Deleted",
            Reply::Pong => "Pong",
            Reply::Closed => "Closed",
            Reply::Error { .. } => "Error",
        }
    }
}

impl ErrorCode {
    /// Rebuild the error on the client side
    pub fn into_error(self, message: String, session: SessionId) -> Error {
        match self {
            ErrorCode::NoNode => Error::NoNode(message),
            ErrorCode::NodeExists => Error::NodeExists(message),
            // The server does not ship the versions, only the path
            ErrorCode::BadVersion => Error::BadVersion { path: message, expected: 0, actual: 0 },
            ErrorCode::NotEmpty => Error::NotEmpty(message),
            ErrorCode::InvalidPath => Error::InvalidPath(message),
            ErrorCode::SessionExpired => Error::SessionExpired(session),
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

/// Everything that travels over a coordinator connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// First frame from the client
    Hello { session_timeout_ms: u64 },
    /// Server answer to `Hello` with the negotiated timeout
    Welcome { session_id: SessionId, session_timeout_ms: u64 },
    Request { xid: u64, request: Request },
    Reply { xid: u64, reply: Reply },
    /// A fired watch, pushed by the server
    Event { watch_id: u64, event: WatchedEvent },
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::Welcome { .. } => "Welcome",
            Frame::Request { .. } => "Request",
            Frame::Reply { .. } => "Reply",
            Frame::Event { .. } => "Event",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Protocol("Frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
