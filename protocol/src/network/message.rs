//! # Wire Protocol
//!
//! Every message between peers is one [`Envelope`], sent as a frame:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────┐
//! │ len: u32 BE  │ JSON envelope (len bytes)           │
//! └──────────────┴─────────────────────────────────────┘
//! ```
//!
//! and the JSON itself looks like
//!
//! ```text
//! {"version":1,"type":"Ping","from":"3f2a…","timestamp":1700000000000,"payload":{"height":12}}
//! ```
//!
//! The message kind set is closed. Raft RPCs reuse the consensus types
//! directly so there's exactly one definition of each field list.
//!
//! Frames larger than [`MAX_FRAME_BYTES`](crate::config::MAX_FRAME_BYTES)
//! are refused before any allocation happens.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{MAX_FRAME_BYTES, WIRE_PROTOCOL_VERSION};
use crate::consensus::{
    AppendEntries, AppendEntriesReply, NodeId, RaftMessage, RequestVote, RequestVoteReply,
};
use crate::storage::Block;
use crate::transaction::Transaction;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u16),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake rejected by peer: {0}")]
    Rejected(String),

    #[error("peer {0} is not connected")]
    PeerNotFound(NodeId),

    #[error("send queue to peer {0} is full or closed")]
    SendFailed(NodeId),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Identity and position a node presents when opening a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub public_key: String,
    pub organization: String,
    pub height: u64,
    /// Address other nodes should dial to reach the sender.
    pub listen_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    #[serde(flatten)]
    pub identity: Handshake,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A peer as advertised to other peers during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub request_id: u64,
    pub from_height: u64,
    pub max_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub request_id: u64,
    pub blocks: Vec<Block>,
    /// The responder's height when it answered.
    pub tip_height: u64,
}

/// All message kinds, tagged by `type` with the body under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    /// A block was committed. Receivers behind fetch it.
    BlockAnnounce { height: u64, hash: String },
    BlockRequest { height: u64 },
    BlockResponse { height: u64, block: Option<Block> },
    TxBroadcast { transaction: Transaction },
    TxForward { transaction: Transaction },
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    PeerList { peers: Vec<PeerAddress> },
    Ping { height: u64 },
    Pong { height: u64 },
}

impl Message {
    /// Short kind name, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::HandshakeAck(_) => "HandshakeAck",
            Self::BlockAnnounce { .. } => "BlockAnnounce",
            Self::BlockRequest { .. } => "BlockRequest",
            Self::BlockResponse { .. } => "BlockResponse",
            Self::TxBroadcast { .. } => "TxBroadcast",
            Self::TxForward { .. } => "TxForward",
            Self::RequestVote(_) => "RequestVote",
            Self::RequestVoteReply(_) => "RequestVoteReply",
            Self::AppendEntries(_) => "AppendEntries",
            Self::AppendEntriesReply(_) => "AppendEntriesReply",
            Self::SyncRequest(_) => "SyncRequest",
            Self::SyncResponse(_) => "SyncResponse",
            Self::PeerList { .. } => "PeerList",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
        }
    }

    /// The Raft RPC inside, if this is one.
    pub fn into_raft(self) -> Result<RaftMessage, Message> {
        match self {
            Self::RequestVote(m) => Ok(RaftMessage::RequestVote(m)),
            Self::RequestVoteReply(m) => Ok(RaftMessage::RequestVoteReply(m)),
            Self::AppendEntries(m) => Ok(RaftMessage::AppendEntries(m)),
            Self::AppendEntriesReply(m) => Ok(RaftMessage::AppendEntriesReply(m)),
            other => Err(other),
        }
    }
}

impl From<RaftMessage> for Message {
    fn from(message: RaftMessage) -> Self {
        match message {
            RaftMessage::RequestVote(m) => Self::RequestVote(m),
            RaftMessage::RequestVoteReply(m) => Self::RequestVoteReply(m),
            RaftMessage::AppendEntries(m) => Self::AppendEntries(m),
            RaftMessage::AppendEntriesReply(m) => Self::AppendEntriesReply(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub from: NodeId,
    /// Sender's wall clock, Unix milliseconds. Informational only.
    pub timestamp: u64,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<NodeId>, message: Message) -> Self {
        Self {
            version: WIRE_PROTOCOL_VERSION,
            from: from.into(),
            timestamp: Utc::now().timestamp_millis().max(0) as u64,
            message,
        }
    }

    pub fn to_bytes(&self) -> NetworkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.version != WIRE_PROTOCOL_VERSION {
            return Err(NetworkError::VersionMismatch(envelope.version));
        }
        Ok(envelope)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Read one length-prefixed envelope.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> NetworkResult<Envelope> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Envelope::from_bytes(&buf)
}

/// Write one length-prefixed envelope and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> NetworkResult<()> {
    let bytes = envelope.to_bytes()?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(NetworkError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
