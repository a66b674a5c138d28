use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};

use crate::mst::{
    error::Error::{self, *},
    node::{NodeId, Rank},
};

/// sent_at (8) | message type (1) | len (4)
pub const HEADER_LEN: usize = 8 + 1 + 4;

/// Largest body a frame may announce. Messages are a handful of scalars.
pub const MAX_BODY_LEN: usize = 4096;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Start signal from the virtual zero node
    Init,
    /// Is the edge between us crossing a fragment boundary?
    Test,
    /// It is
    Accept,
    /// It isn't
    Reject,
    /// Smallest outgoing edge found in a child's sub-tree
    Report,
    /// Routed from the root towards the node holding the best edge
    Merge,
    /// Request to unify across the edge it travels on
    Connect,
    /// Top-down relabel broadcast
    NewFragment,
    /// Relabel finished for the sender's sub-tree
    Ack,
    /// Start a test round in the sender's sub-tree
    DoTest,
    /// Stop, the spanning tree is complete
    Terminate,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match value {
            0 => Init,
            1 => Test,
            2 => Accept,
            3 => Reject,
            4 => Report,
            5 => Merge,
            6 => Connect,
            7 => NewFragment,
            8 => Ack,
            9 => DoTest,
            10 => Terminate,
            other => Err(UnknownMessageType(other))?,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Init => "INIT",
            MessageType::Test => "TEST",
            MessageType::Accept => "ACCEPT",
            MessageType::Reject => "REJECT",
            MessageType::Report => "REPORT",
            MessageType::Merge => "MERGE",
            MessageType::Connect => "CONNECT",
            MessageType::NewFragment => "NEW_FRAGMENT",
            MessageType::Ack => "ACK",
            MessageType::DoTest => "DOTEST",
            MessageType::Terminate => "TERMINATE",
        };
        f.write_str(name)
    }
}

/// Message parameters. Only small scalars ever travel, never node state.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Payload {
    Init,
    Test { fragment: NodeId },
    Accept,
    Reject,
    Report { min_weight: Option<Rank> },
    Merge,
    Connect,
    NewFragment { fragment: NodeId },
    Ack,
    DoTest,
    Terminate,
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::Init => MessageType::Init,
            Payload::Test { .. } => MessageType::Test,
            Payload::Accept => MessageType::Accept,
            Payload::Reject => MessageType::Reject,
            Payload::Report { .. } => MessageType::Report,
            Payload::Merge => MessageType::Merge,
            Payload::Connect => MessageType::Connect,
            Payload::NewFragment { .. } => MessageType::NewFragment,
            Payload::Ack => MessageType::Ack,
            Payload::DoTest => MessageType::DoTest,
            Payload::Terminate => MessageType::Terminate,
        }
    }
}

/// A protocol message as delivered to a node. Immutable once sent.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Message {
    pub from: NodeId,
    pub payload: Payload,
}

impl Message {
    pub fn new(from: NodeId, payload: Payload) -> Self {
        Self { from, payload }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            Payload::Test { fragment } | Payload::NewFragment { fragment } => {
                write!(f, "{}({}) from {}", self.kind(), fragment, self.from)
            }
            Payload::Report {
                min_weight: Some(rank),
            } => write!(f, "{}({}) from {}", self.kind(), rank, self.from),
            Payload::Report { min_weight: None } => {
                write!(f, "{}(inf) from {}", self.kind(), self.from)
            }
            _ => write!(f, "{} from {}", self.kind(), self.from),
        }
    }
}

/// Outbound message together with its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub message: Message,
}

/// Encodes a message into a frame stamped with the current time.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let body = to_bytes::<_, 256>(msg).map_err(|_| CouldNotEncodeMessage)?;
    let len = u32::try_from(body.len()).map_err(|_| CouldNotEncodeMessage)?;
    let mut buf = vec![0u8; HEADER_LEN];
    LittleEndian::write_i64(&mut buf[0..8], Utc::now().timestamp_micros());
    buf[8] = msg.kind() as u8;
    LittleEndian::write_u32(&mut buf[9..13], len);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Reads the body length announced by a frame header, so stream readers
/// know how much more to pull.
pub fn body_len(header: &[u8]) -> Result<usize, Error> {
    if header.len() < HEADER_LEN {
        Err(TruncatedFrame)?
    }
    let len = LittleEndian::read_u32(&header[9..13]) as usize;
    if len > MAX_BODY_LEN {
        Err(FrameTooLarge(len))?
    }
    Ok(len)
}

/// Decodes a frame into its send timestamp (µs since the epoch) and message.
pub fn decode(buf: &[u8]) -> Result<(i64, Message), Error> {
    if buf.len() < HEADER_LEN {
        Err(TruncatedFrame)?
    }
    let sent_at = LittleEndian::read_i64(&buf[0..8]);
    let kind = MessageType::try_from(buf[8])?;
    let len = body_len(buf)?;
    let body = buf
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(TruncatedFrame)?;

    // archived data must be aligned before it can be validated
    let mut aligned = AlignedVec::with_capacity(len);
    aligned.extend_from_slice(body);
    let msg: Message = from_bytes(&aligned).map_err(|_| CouldNotDecodeMessage)?;

    if msg.kind() != kind {
        Err(CouldNotDecodeMessage)?
    }
    Ok((sent_at, msg))
}
