//! Messaging node: registers with the registry, links up with its overlay
//! neighbors, routes data packets and reports traffic counters.
//!
//! Two kinds of links end here. The registry link carries the control
//! protocol and losing it is fatal to the node. Neighbor links carry DATA
//! only; losing one is logged and nothing else.

mod round;
mod source;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use overlay_core::config::NodeConfig;
use overlay_core::wire::{Tag, UNASSIGNED_ID};
use overlay_core::{Message, NodeId, Route, RoutingTable, TrafficCounters};

use crate::cache::ConnectionCache;
use crate::connection::{Connection, ConnectionError};
use crate::dispatch::{Dispatcher, EventHandler};

use round::RoundLedger;

pub use source::PacketSource;

const REGISTRY_LINK_TAGS: &[Tag] = &[
    Tag::RegisterStatus,
    Tag::Manifest,
    Tag::TaskInitiate,
    Tag::SummaryRequest,
];

const NEIGHBOR_TAGS: &[Tag] = &[Tag::Data];

/// Packets generated between yields to the scheduler.
const YIELD_EVERY: u32 = 64;

/// How long late packets are batched before a follow-up TRAFFIC_SUMMARY.
const SUMMARY_UPDATE_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("failed to open neighbor listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to connect to registry at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("registry link lost before registration completed")]
    RegistryLost,

    #[error("cannot advertise {0}: not an IPv4 address")]
    NotIpv4(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Default)]
struct NodeState {
    id: NodeId,
    routes: RoutingTable,
    members: Vec<NodeId>,
    ledger: RoundLedger,
}

pub struct MessagingNode {
    me: Weak<MessagingNode>,
    seed: u64,
    /// Where neighbors reach this node, as sent in REGISTER.
    advertised: SocketAddr,
    state: Mutex<NodeState>,
    /// Outbound neighbor links by neighbor id.
    links: ConnectionCache,
    /// Links neighbors opened to us.
    inbound: Mutex<Vec<Connection>>,
    registry: OnceLock<Connection>,
    pending_status: Mutex<Option<oneshot::Sender<(NodeId, String)>>>,
    registry_lost: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    /// Serializes overlay link setup across manifests.
    setup: tokio::sync::Mutex<()>,
}

impl MessagingNode {
    /// Open the neighbor listener, dial the registry and register.
    ///
    /// Resolves once REGISTER_STATUS arrives. A rejection comes back as
    /// `PeerError::Rejected` with the registry's message.
    pub async fn join(registry: SocketAddr, config: &NodeConfig) -> Result<Arc<Self>, PeerError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
            .await
            .map_err(PeerError::Bind)?;
        let listen_port = listener.local_addr().map_err(PeerError::Bind)?.port();

        let stream = TcpStream::connect(registry)
            .await
            .map_err(|source| PeerError::Connect { addr: registry, source })?;
        let advertise_ip = advertised_ip(&config.advertise_host, &stream)?;

        let (status_tx, status_rx) = oneshot::channel();
        let (registry_lost, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let node = Arc::new_cyclic(|me| MessagingNode {
            me: me.clone(),
            seed: config.seed,
            advertised: SocketAddr::from((advertise_ip, listen_port)),
            state: Mutex::new(NodeState {
                id: UNASSIGNED_ID,
                ..NodeState::default()
            }),
            links: ConnectionCache::new(),
            inbound: Mutex::new(Vec::new()),
            registry: OnceLock::new(),
            pending_status: Mutex::new(Some(status_tx)),
            registry_lost,
            shutdown,
            setup: tokio::sync::Mutex::new(()),
        });

        let link_handler = Arc::new(RegistryLink { node: node.clone() });
        let dispatcher = Arc::new(Dispatcher::for_owner(link_handler, REGISTRY_LINK_TAGS));
        let link = Connection::spawn(stream, dispatcher)
            .map_err(|source| PeerError::Connect { addr: registry, source })?;
        let _ = node.registry.set(link.clone());

        tokio::spawn(node.clone().accept_loop(listener, node.shutdown.subscribe()));

        link.send(&Message::Register {
            addr: advertise_ip,
            port: listen_port,
        })?;

        let (id, message) = match status_rx.await {
            Ok(status) => status,
            Err(_) => {
                node.shutdown();
                return Err(PeerError::RegistryLost);
            }
        };
        if id < 0 {
            node.shutdown();
            return Err(PeerError::Rejected(message));
        }

        tracing::info!(peer = id, advertised = %node.advertised, "{message}");
        Ok(node)
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc(&self) -> anyhow::Result<Arc<Self>> {
        self.me.upgrade().context("messaging node is shutting down")
    }

    fn registry_link(&self) -> anyhow::Result<&Connection> {
        self.registry.get().context("registry link not established")
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let dispatcher = Arc::new(Dispatcher::for_owner(self.clone(), NEIGHBOR_TAGS));
        loop {
            // The flag only ever flips to true.
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "neighbor accept failed");
                    continue;
                }
            };
            match Connection::spawn(stream, dispatcher.clone()) {
                Ok(conn) => {
                    tracing::debug!(%remote, "neighbor linked in");
                    let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
                    inbound.retain(Connection::is_open);
                    inbound.push(conn);
                }
                Err(e) => tracing::warn!(%remote, error = %e, "failed to start neighbor connection"),
            }
        }
        tracing::debug!("neighbor listener stopped");
    }

    // ── Registry protocol ────────────────────────────────────────────────────

    fn on_register_status(&self, id: NodeId, message: String) {
        if id >= 0 {
            self.lock().id = id;
        }
        let pending = self
            .pending_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(tx) => {
                let _ = tx.send((id, message));
            }
            None => tracing::warn!(id, status = %message, "unsolicited registration status"),
        }
    }

    fn on_manifest(&self, routes: RoutingTable, members: Vec<NodeId>) -> anyhow::Result<()> {
        {
            let mut state = self.lock();
            tracing::info!(
                peer = state.id,
                neighbors = ?routes.neighbor_ids(),
                members = members.len(),
                "manifest received"
            );
            state.routes = routes.clone();
            state.members = members;
            state.ledger.restart();
        }
        tokio::spawn(self.arc()?.set_up_links(routes));
        Ok(())
    }

    /// Replace all outbound neighbor links with links to `routes`, then
    /// report the outcome to the registry.
    async fn set_up_links(self: Arc<Self>, routes: RoutingTable) {
        let _guard = self.setup.lock().await;
        self.links.close_all();

        let dispatcher = Arc::new(Dispatcher::for_owner(self.clone(), NEIGHBOR_TAGS));
        let mut failures = Vec::new();
        for route in routes.routes() {
            let linked = match TcpStream::connect(route.socket_addr()).await {
                Ok(stream) => Connection::spawn(stream, dispatcher.clone()),
                Err(e) => Err(e),
            };
            match linked {
                Ok(conn) => {
                    conn.set_peer_id(route.guid);
                    self.links.insert(route.guid, conn);
                }
                Err(e) => {
                    tracing::warn!(neighbor = route.guid, addr = %route.socket_addr(), error = %e, "failed to link to neighbor");
                    failures.push(route.guid);
                }
            }
        }

        let id = self.id();
        let status = if failures.is_empty() {
            tracing::info!(peer = id, links = routes.len(), "overlay links established");
            Message::SetupStatus {
                id,
                message: format!("Node {id} established {} overlay links", routes.len()),
            }
        } else {
            Message::SetupStatus {
                id: UNASSIGNED_ID,
                message: format!("Node {id} could not link to {failures:?}"),
            }
        };
        if let Err(e) = self.registry_link().and_then(|link| link.send(&status).map_err(Into::into)) {
            tracing::warn!(peer = id, error = %e, "failed to report setup status");
        }
    }

    fn on_task_initiate(&self, packets: u32) -> anyhow::Result<()> {
        let round = self.lock().ledger.begin();
        tokio::spawn(self.arc()?.run_round(round, packets));
        Ok(())
    }

    async fn run_round(self: Arc<Self>, round: u32, packets: u32) {
        let (id, mut source) = {
            let state = self.lock();
            (state.id, PacketSource::new(self.seed, state.id, &state.members))
        };
        tracing::info!(peer = id, round, packets, "task round started");

        for n in 0..packets {
            let Some((destination, payload)) = source.next_packet() else {
                tracing::warn!(peer = id, "no other members, nothing to send");
                break;
            };
            let packet = Message::Data {
                destination,
                source: id,
                round,
                payload,
                trace: Vec::new(),
            };
            {
                let mut state = self.lock();
                if state.ledger.round() != round {
                    tracing::warn!(peer = id, round, "round superseded, stopping generation");
                    return;
                }
                match self.forward(&state, id, destination, &packet) {
                    Ok(()) => state.ledger.record_sent(payload),
                    Err(e) => tracing::warn!(peer = id, destination, error = %e, "packet dropped"),
                }
            }
            if n % YIELD_EVERY == YIELD_EVERY - 1 {
                tokio::task::yield_now().await;
            }
        }

        let state = self.lock();
        if state.ledger.round() != round {
            return;
        }
        let counters = state.ledger.current();
        tracing::info!(peer = id, round, sent = counters.sent, "task round finished");
        let finished = Message::TaskFinished { id, counters };
        if let Err(e) = self.registry_link().and_then(|link| link.send(&finished).map_err(Into::into)) {
            tracing::warn!(peer = id, error = %e, "failed to report task finished");
        }
    }

    /// Answer with this round's counters. Packets of the round that arrive
    /// afterwards are reported in follow-up summaries.
    fn on_summary_request(&self, conn: &Connection) -> anyhow::Result<()> {
        let mut state = self.lock();
        let counters = state.ledger.summary_requested();
        conn.send(&Message::TrafficSummary { id: state.id, counters })
            .context("failed to queue TRAFFIC_SUMMARY")?;
        tracing::info!(
            peer = state.id,
            round = state.ledger.round(),
            sent = counters.sent,
            received = counters.received,
            relayed = counters.relayed,
            "traffic summary sent"
        );
        Ok(())
    }

    async fn send_summary_update(self: Arc<Self>, round: u32) {
        tokio::time::sleep(SUMMARY_UPDATE_DELAY).await;
        // Queued under the lock so it cannot trail the next TASK_FINISHED.
        let mut state = self.lock();
        let Some(counters) = state.ledger.take_update(round) else {
            return;
        };
        let update = Message::TrafficSummary { id: state.id, counters };
        match self.registry_link().and_then(|link| link.send(&update).map_err(Into::into)) {
            Ok(()) => tracing::debug!(
                peer = state.id,
                round,
                received = counters.received,
                relayed = counters.relayed,
                "traffic summary updated"
            ),
            Err(e) => tracing::warn!(peer = state.id, error = %e, "failed to send traffic summary update"),
        }
    }

    // ── Data path ────────────────────────────────────────────────────────────

    /// Send `packet` one hop closer to `destination`.
    fn forward(
        &self,
        state: &NodeState,
        local: NodeId,
        destination: NodeId,
        packet: &Message,
    ) -> anyhow::Result<()> {
        let Some(hop) = state.routes.next_hop(local, destination, &state.members) else {
            bail!("no route from {local} to {destination}");
        };
        let conn = self
            .links
            .get(hop.guid)
            .with_context(|| format!("no link to neighbor {}", hop.guid))?;
        conn.send(packet)?;
        Ok(())
    }

    fn on_data(
        &self,
        destination: NodeId,
        source: NodeId,
        round: u32,
        payload: i32,
        mut trace: Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        let id = state.id;
        if destination == id {
            return self.count(&mut state, round, |c| c.record_received(payload));
        }
        if source == id || trace.contains(&id) {
            bail!("packet from {source} to {destination} looped back through {id}");
        }

        trace.push(id);
        let packet = Message::Data {
            destination,
            source,
            round,
            payload,
            trace,
        };
        self.forward(&state, id, destination, &packet)?;
        self.count(&mut state, round, TrafficCounters::record_relayed)
    }

    /// Count a packet into the round it was stamped with, scheduling a
    /// follow-up summary if the registry already has this round's counters.
    fn count(
        &self,
        state: &mut NodeState,
        round: u32,
        record: impl FnOnce(&mut TrafficCounters),
    ) -> anyhow::Result<()> {
        let (id, current) = (state.id, state.ledger.round());
        let Some(counters) = state.ledger.counters_for(round) else {
            tracing::debug!(peer = id, round, current, "packet outside the open rounds, not counted");
            return Ok(());
        };
        record(counters);
        if state.ledger.wants_update(round) {
            tokio::spawn(self.arc()?.send_summary_update(round));
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn id(&self) -> NodeId {
        self.lock().id
    }

    /// Counters of the current round.
    pub fn counters(&self) -> TrafficCounters {
        self.lock().ledger.current()
    }

    pub fn routing_table(&self) -> RoutingTable {
        self.lock().routes.clone()
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.lock().members.clone()
    }

    /// Address neighbors dial to reach this node.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    /// Route describing this node as the registry lists it.
    pub fn route(&self) -> Option<Route> {
        match self.advertised {
            SocketAddr::V4(v4) => Some(Route::new(*v4.ip(), v4.port(), self.id())),
            SocketAddr::V6(_) => None,
        }
    }

    /// Ids of neighbors with an open outbound link.
    pub fn links_up(&self) -> Vec<NodeId> {
        let stale = self.links.stale_ids();
        self.links.ids().into_iter().filter(|id| !stale.contains(id)).collect()
    }

    /// Flips to true when the registry link breaks without us closing it.
    pub fn registry_lost(&self) -> watch::Receiver<bool> {
        self.registry_lost.subscribe()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|conn| conn.is_open())
            .count();
        Diagnostics {
            id: self.id(),
            advertised: self.advertised,
            counters: self.counters(),
            links: self.links_up(),
            inbound,
            registry_open: self.registry.get().is_some_and(Connection::is_open),
        }
    }

    /// Close every link and stop accepting neighbors.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(link) = self.registry.get() {
            link.close();
        }
        self.links.close_all();
        for conn in self.inbound.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            conn.close();
        }
        tracing::info!(peer = self.id(), "messaging node shut down");
    }
}

/// Neighbor links.
impl EventHandler for MessagingNode {
    fn handle(&self, _conn: &Connection, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Data {
                destination,
                source,
                round,
                payload,
                trace,
            } => self.on_data(destination, source, round, payload, trace),
            other => bail!("unexpected {:?} on a neighbor link", other.tag()),
        }
    }

    fn connection_lost(&self, conn: &Connection) {
        tracing::warn!(
            peer = self.id(),
            neighbor = conn.peer_id(),
            remote = %conn.remote_addr(),
            "neighbor link lost"
        );
    }
}

/// The registry end of a node, dispatched separately so that only its loss
/// is fatal.
struct RegistryLink {
    node: Arc<MessagingNode>,
}

impl EventHandler for RegistryLink {
    fn handle(&self, conn: &Connection, message: Message) -> anyhow::Result<()> {
        match message {
            Message::RegisterStatus { id, message } => {
                self.node.on_register_status(id, message);
                Ok(())
            }
            Message::Manifest { routes, members } => self.node.on_manifest(routes, members),
            Message::TaskInitiate { packets } => self.node.on_task_initiate(packets),
            Message::SummaryRequest => self.node.on_summary_request(conn),
            other => bail!("unexpected {:?} from the registry", other.tag()),
        }
    }

    fn connection_lost(&self, conn: &Connection) {
        tracing::error!(peer = self.node.id(), remote = %conn.remote_addr(), "lost connection to the registry");
        // Fails a join still waiting for REGISTER_STATUS.
        self.node
            .pending_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.node.registry_lost.send_replace(true);
    }
}

/// Counters and link state for `print-counters-and-diagnostics`.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub id: NodeId,
    pub advertised: SocketAddr,
    pub counters: TrafficCounters,
    pub links: Vec<NodeId>,
    pub inbound: usize,
    pub registry_open: bool,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "node {} at {}", self.id, self.advertised)?;
        writeln!(f, "  sent         {:>10}   sum {:>16}", c.sent, c.sum_sent)?;
        writeln!(f, "  received     {:>10}   sum {:>16}", c.received, c.sum_received)?;
        writeln!(f, "  relayed      {:>10}", c.relayed)?;
        writeln!(f, "  links out    {:?}", self.links)?;
        writeln!(f, "  links in     {}", self.inbound)?;
        write!(f, "  registry     {}", if self.registry_open { "connected" } else { "lost" })
    }
}

/// The IPv4 address to put in REGISTER: the configured host if any, else the
/// local end of the registry link.
fn advertised_ip(host: &str, registry_link: &TcpStream) -> Result<Ipv4Addr, PeerError> {
    if !host.is_empty() {
        return host.parse().map_err(|_| PeerError::NotIpv4(host.to_string()));
    }
    let local = registry_link.local_addr().map_err(PeerError::Bind)?;
    match local.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => ip
            .to_ipv4_mapped()
            .ok_or_else(|| PeerError::NotIpv4(ip.to_string())),
    }
}
