//! Message codec: typed overlay messages to and from frame payloads.
//!
//! Every payload starts with a one-byte [`Tag`] followed by tag-specific
//! fields in a fixed order. Strings are a 4-byte length plus UTF-8 bytes.
//! This is the only place that understands message structure.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::{AsBytes, FromBytes};

use crate::routing::{NodeId, Route, RoutingTable};
use crate::stats::TrafficCounters;
use crate::wire::{RouteRecord, Tag, TrafficRecord, WireError};

/// One decoded overlay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Peer asks to join, advertising where it listens for neighbor links.
    Register { addr: Ipv4Addr, port: u16 },

    /// Registry answers a registration. `id` is −1 on failure.
    RegisterStatus { id: i32, message: String },

    /// Registry pushes the node's routing table and the full membership list.
    Manifest {
        routes: RoutingTable,
        members: Vec<NodeId>,
    },

    /// Peer reports overlay link setup. `id` is −1 on failure.
    SetupStatus { id: i32, message: String },

    /// Registry starts a round: generate `packets` data packets.
    TaskInitiate { packets: u32 },

    /// A routed data packet. `round` is the sender's task round, counted
    /// from its last manifest. `trace` lists the nodes that relayed it.
    Data {
        destination: NodeId,
        source: NodeId,
        round: u32,
        payload: i32,
        trace: Vec<NodeId>,
    },

    /// Peer finished sending its packets for the round.
    TaskFinished {
        id: NodeId,
        counters: TrafficCounters,
    },

    /// Registry asks every peer for its traffic counters.
    SummaryRequest,

    /// Peer answers a summary request.
    TrafficSummary {
        id: NodeId,
        counters: TrafficCounters,
    },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Register { .. } => Tag::Register,
            Message::RegisterStatus { .. } => Tag::RegisterStatus,
            Message::Manifest { .. } => Tag::Manifest,
            Message::SetupStatus { .. } => Tag::SetupStatus,
            Message::TaskInitiate { .. } => Tag::TaskInitiate,
            Message::Data { .. } => Tag::Data,
            Message::TaskFinished { .. } => Tag::TaskFinished,
            Message::SummaryRequest => Tag::SummaryRequest,
            Message::TrafficSummary { .. } => Tag::TrafficSummary,
        }
    }

    /// Serialize into a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.tag().into());

        match self {
            Message::Register { addr, port } => {
                buf.put_slice(&addr.octets());
                buf.put_u32(u32::from(*port));
            }
            Message::RegisterStatus { id, message } | Message::SetupStatus { id, message } => {
                buf.put_i32(*id);
                put_string(&mut buf, message);
            }
            Message::Manifest { routes, members } => {
                buf.put_u32(routes.len() as u32);
                for route in routes.routes() {
                    buf.put_slice(route.to_record().as_bytes());
                }
                put_ids(&mut buf, members);
            }
            Message::TaskInitiate { packets } => {
                buf.put_u32(*packets);
            }
            Message::Data {
                destination,
                source,
                round,
                payload,
                trace,
            } => {
                buf.put_i32(*destination);
                buf.put_i32(*source);
                buf.put_u32(*round);
                buf.put_i32(*payload);
                put_ids(&mut buf, trace);
            }
            Message::TaskFinished { id, counters } | Message::TrafficSummary { id, counters } => {
                buf.put_i32(*id);
                buf.put_slice(counters.to_record().as_bytes());
            }
            Message::SummaryRequest => {}
        }

        buf.freeze()
    }

    /// Parse a frame payload. Unknown tags, short payloads and trailing
    /// bytes are all errors.
    pub fn decode(payload: &[u8]) -> Result<Message, WireError> {
        let (&first, rest) = payload.split_first().ok_or(WireError::Empty)?;
        let tag = Tag::try_from(first)?;
        let mut r = Reader { tag, buf: rest };

        let message = match tag {
            Tag::Register => {
                let addr = Ipv4Addr::from(r.array::<4>()?);
                let port = r.port()?;
                Message::Register { addr, port }
            }
            Tag::RegisterStatus => Message::RegisterStatus {
                id: r.i32()?,
                message: r.string()?,
            },
            Tag::SetupStatus => Message::SetupStatus {
                id: r.i32()?,
                message: r.string()?,
            },
            Tag::Manifest => {
                let count = r.u32()? as usize;
                let mut routes = RoutingTable::new();
                for _ in 0..count {
                    let record: RouteRecord = r.record()?;
                    let route = Route::from_record(&record)?;
                    let guid = route.guid;
                    if !routes.add_route(route) {
                        return Err(WireError::DuplicateRoute(guid));
                    }
                }
                let members = r.ids()?;
                Message::Manifest { routes, members }
            }
            Tag::TaskInitiate => Message::TaskInitiate { packets: r.u32()? },
            Tag::Data => Message::Data {
                destination: r.i32()?,
                source: r.i32()?,
                round: r.u32()?,
                payload: r.i32()?,
                trace: r.ids()?,
            },
            Tag::TaskFinished => {
                let id = r.i32()?;
                let record: TrafficRecord = r.record()?;
                Message::TaskFinished {
                    id,
                    counters: TrafficCounters::from_record(&record),
                }
            }
            Tag::SummaryRequest => Message::SummaryRequest,
            Tag::TrafficSummary => {
                let id = r.i32()?;
                let record: TrafficRecord = r.record()?;
                Message::TrafficSummary {
                    id,
                    counters: TrafficCounters::from_record(&record),
                }
            }
        };

        r.finish()?;
        Ok(message)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_ids(buf: &mut BytesMut, ids: &[NodeId]) {
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_i32(*id);
    }
}

// ── Decoding cursor ──────────────────────────────────────────────────────────

struct Reader<'a> {
    tag: Tag,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                tag: self.tag,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn port(&mut self) -> Result<u16, WireError> {
        let raw = self.u32()?;
        u16::try_from(raw).map_err(|_| WireError::PortOutOfRange(raw))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn ids(&mut self) -> Result<Vec<NodeId>, WireError> {
        let count = self.u32()? as usize;
        // Bounds-check the whole list before allocating.
        self.need(count.saturating_mul(4))?;
        (0..count).map(|_| self.i32()).collect()
    }

    fn record<T: FromBytes>(&mut self) -> Result<T, WireError> {
        let raw = self.bytes(std::mem::size_of::<T>())?;
        T::read_from(raw).ok_or(WireError::Truncated {
            tag: self.tag,
            needed: std::mem::size_of::<T>(),
            remaining: raw.len(),
        })
    }

    fn finish(self) -> Result<(), WireError> {
        match self.buf.len() {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra, self.tag)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
