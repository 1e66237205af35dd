//! Routing data model: registered peers, overlay edges, per-node tables.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use zerocopy::byteorder::{I32, U32};

use crate::wire::{RouteRecord, WireError};

/// Identity assigned by the registry. Dense, 0-based, in registration order.
pub type NodeId = i32;

// ── Route ────────────────────────────────────────────────────────────────────

/// One overlay edge endpoint: where a node listens and which id it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub guid: NodeId,
}

impl Route {
    pub fn new(addr: Ipv4Addr, port: u16, guid: NodeId) -> Self {
        Self { addr, port, guid }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.addr, self.port))
    }

    pub fn to_record(&self) -> RouteRecord {
        RouteRecord {
            addr: self.addr.octets(),
            port: U32::new(u32::from(self.port)),
            guid: I32::new(self.guid),
        }
    }

    pub fn from_record(record: &RouteRecord) -> Result<Self, WireError> {
        let port = record.port.get();
        let port = u16::try_from(port).map_err(|_| WireError::PortOutOfRange(port))?;
        Ok(Self {
            addr: Ipv4Addr::from(record.addr),
            port,
            guid: record.guid.get(),
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (id {})", self.addr, self.port, self.guid)
    }
}

// ── RoutingTable ─────────────────────────────────────────────────────────────

/// Outbound neighbor set of exactly one node, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Returns false (and leaves the table alone) when a route
    /// to the same guid is already present.
    pub fn add_route(&mut self, route: Route) -> bool {
        if self.contains(route.guid) {
            return false;
        }
        self.routes.push(route);
        true
    }

    pub fn contains(&self, guid: NodeId) -> bool {
        self.routes.iter().any(|r| r.guid == guid)
    }

    pub fn get(&self, guid: NodeId) -> Option<&Route> {
        self.routes.iter().find(|r| r.guid == guid)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.routes.iter().map(|r| r.guid).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Pick the neighbor that gets a packet from `local` closest to
    /// `destination` without passing it.
    ///
    /// Distances are measured clockwise around the ring formed by `members`
    /// (the manifest membership list, in order). Returns None when either
    /// node is not a member or no neighbor lies between them.
    pub fn next_hop(&self, local: NodeId, destination: NodeId, members: &[NodeId]) -> Option<&Route> {
        let n = members.len();
        let position = |id: NodeId| members.iter().position(|&m| m == id);
        let from = position(local)?;
        let target = (position(destination)? + n - from) % n;
        if target == 0 {
            return None;
        }

        self.routes
            .iter()
            .filter_map(|route| {
                let distance = (position(route.guid)? + n - from) % n;
                (distance > 0 && distance <= target).then_some((distance, route))
            })
            .max_by_key(|(distance, _)| *distance)
            .map(|(_, route)| route)
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in &self.routes {
            writeln!(f, "  -> {route}")?;
        }
        Ok(())
    }
}

impl FromIterator<Route> for RoutingTable {
    fn from_iter<I: IntoIterator<Item = Route>>(iter: I) -> Self {
        let mut table = RoutingTable::new();
        for route in iter {
            table.add_route(route);
        }
        table
    }
}

// ── RegisterItem ─────────────────────────────────────────────────────────────

/// A peer as the registry knows it.
///
/// Two items are the same registration when address and port match; the id
/// is not part of identity because it is unset until registration succeeds.
#[derive(Debug, Clone)]
pub struct RegisterItem {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub id: Option<NodeId>,
    /// Overlay link setup acknowledged.
    pub ready: bool,
    /// Current task round finished.
    pub complete: bool,
}

impl RegisterItem {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            id: None,
            ready: false,
            complete: false,
        }
    }

    /// Route to this item. Unregistered items carry guid −1.
    pub fn route(&self) -> Route {
        Route::new(self.addr, self.port, self.id.unwrap_or(crate::wire::UNASSIGNED_ID))
    }
}

impl PartialEq for RegisterItem {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl Eq for RegisterItem {}

// ── Tests ────────────────────────────────────────────────────────────────────
