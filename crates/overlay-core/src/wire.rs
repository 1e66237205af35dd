//! Overlay wire format: tags and fixed-layout records.
//!
//! These types ARE the protocol. Tag values, field order and record sizes
//! must match exactly between independently built registries and messaging
//! nodes. All integers on the wire are big-endian.
//!
//! Fixed records use zerocopy derives over big-endian integer wrappers, so
//! they have alignment 1, no padding, and need no unsafe code to read.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, I32, I64, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Tags ─────────────────────────────────────────────────────────────────────

/// First byte of every message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Peer → registry: advertised IPv4 address and listening port.
    Register = 2,
    /// Registry → peer: assigned id (−1 on failure) and a status message.
    RegisterStatus = 3,
    /// Registry → peer: routing table plus full membership list.
    Manifest = 6,
    /// Peer → registry: overlay links are up (or failed).
    SetupStatus = 7,
    /// Registry → peer: generate and route N packets.
    TaskInitiate = 8,
    /// Peer → peer: one routed data packet.
    Data = 9,
    /// Peer → registry: all packets of this round were sent.
    TaskFinished = 10,
    /// Registry → peer: report traffic counters.
    SummaryRequest = 11,
    /// Peer → registry: traffic counters for the round.
    TrafficSummary = 12,
}

impl TryFrom<u8> for Tag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Tag::Register),
            3 => Ok(Tag::RegisterStatus),
            6 => Ok(Tag::Manifest),
            7 => Ok(Tag::SetupStatus),
            8 => Ok(Tag::TaskInitiate),
            9 => Ok(Tag::Data),
            10 => Ok(Tag::TaskFinished),
            11 => Ok(Tag::SummaryRequest),
            12 => Ok(Tag::TrafficSummary),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl From<Tag> for u8 {
    fn from(t: Tag) -> u8 {
        t as u8
    }
}

// ── Route record ─────────────────────────────────────────────────────────────

/// One manifest entry: where a neighbor listens and which id it holds.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RouteRecord {
    /// IPv4 address octets in network order.
    pub addr: [u8; 4],
    /// Listening port. Carried in four bytes; values above 65535 are invalid.
    pub port: U32<BigEndian>,
    /// Neighbor id.
    pub guid: I32<BigEndian>,
}

assert_eq_size!(RouteRecord, [u8; 12]);

// ── Traffic record ───────────────────────────────────────────────────────────

/// Statistics block carried by TASK_FINISHED and TRAFFIC_SUMMARY.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TrafficRecord {
    pub sent: U32<BigEndian>,
    pub relayed: U32<BigEndian>,
    pub received: U32<BigEndian>,
    pub sum_sent: I64<BigEndian>,
    pub sum_received: I64<BigEndian>,
}

assert_eq_size!(TrafficRecord, [u8; 28]);

// ── Constants ────────────────────────────────────────────────────────────────

/// Maximum number of peers the registry will admit.
pub const REGISTRY_CAPACITY: usize = 127;

/// Id carried in status messages when no id was assigned.
pub const UNASSIGNED_ID: i32 = -1;

/// Largest frame body accepted by the framing layer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Manifest size used when the operator does not give one.
pub const DEFAULT_MANIFEST_SIZE: u32 = 3;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("truncated {tag:?} message: needed {needed} more bytes, {remaining} left")]
    Truncated {
        tag: Tag,
        needed: usize,
        remaining: usize,
    },

    #[error("{0} trailing bytes after {1:?} message")]
    TrailingBytes(usize, Tag),

    #[error("status message is not valid UTF-8")]
    InvalidUtf8,

    #[error("port {0} out of range")]
    PortOutOfRange(u32),

    #[error("manifest lists neighbor {0} more than once")]
    DuplicateRoute(i32),
}

// ── Tests ────────────────────────────────────────────────────────────────────
