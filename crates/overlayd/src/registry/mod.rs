//! The registry: admits messaging nodes, builds the overlay and drives task
//! rounds.
//!
//! Every piece of shared state lives in one `RegistryState` behind one mutex.
//! Each operation takes the lock once and does all of its bookkeeping and
//! queueing inside it, so a size check and the insert that follows it, or a
//! completion scan and the broadcast it triggers, can never interleave with
//! another connection's handler.

mod report;
pub mod topology;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use socket2::SockRef;
use tokio::net::TcpListener;
use tokio::sync::watch;

use overlay_core::wire::{Tag, REGISTRY_CAPACITY};
use overlay_core::{Message, NodeId, RegisterItem, RoutingTable, TrafficCounters};

use crate::cache::ConnectionCache;
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, EventHandler};

pub use report::TrafficReport;

/// Tags the registry consumes.
const REGISTRY_TAGS: &[Tag] = &[
    Tag::Register,
    Tag::SetupStatus,
    Tag::TaskFinished,
    Tag::TrafficSummary,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("This node is already registered")]
    AlreadyRegistered,

    #[error("Registry is full.")]
    RegistryFull,
}

/// One row of `list-messaging-nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub ready: bool,
    pub complete: bool,
    /// The node's connection has closed; its entry stays in place.
    pub stale: bool,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {:>3}  {}:{}", self.id, self.addr, self.port)?;
        if self.ready {
            write!(f, "  ready")?;
        }
        if self.complete {
            write!(f, "  complete")?;
        }
        if self.stale {
            write!(f, "  (stale)")?;
        }
        Ok(())
    }
}

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    /// Registered nodes; the index is the id.
    items: Vec<RegisterItem>,
    /// Routing table per node from the last topology build.
    manifests: Vec<RoutingTable>,
    round: Round,
}

/// Bookkeeping for the current task round.
#[derive(Default)]
struct Round {
    packets: Option<u32>,
    summary_requested: bool,
    summaries: Vec<(NodeId, TrafficCounters)>,
}

impl RegistryState {
    fn register(&mut self, mut item: RegisterItem) -> Result<NodeId, RegistrationError> {
        if self.items.contains(&item) {
            return Err(RegistrationError::AlreadyRegistered);
        }
        if self.items.len() >= REGISTRY_CAPACITY {
            return Err(RegistrationError::RegistryFull);
        }
        let id = self.items.len() as NodeId;
        item.id = Some(id);
        item.ready = false;
        item.complete = false;
        self.items.push(item);
        Ok(id)
    }

    fn item_mut(&mut self, id: NodeId) -> Option<&mut RegisterItem> {
        usize::try_from(id).ok().and_then(|i| self.items.get_mut(i))
    }

    fn members(&self) -> Vec<NodeId> {
        (0..self.items.len() as NodeId).collect()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct Registry {
    state: Mutex<RegistryState>,
    cache: ConnectionCache,
    summary_broadcasts: AtomicUsize,
    reports: watch::Sender<Option<TrafficReport>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (reports, _) = watch::channel(None);
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            cache: ConnectionCache::new(),
            summary_broadcasts: AtomicUsize::new(0),
            reports,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind 0.0.0.0:`port` and accept nodes in the background. Every
    /// accepted socket gets a connection right away; it has no id until a
    /// REGISTER on it succeeds.
    pub async fn start_listening(self: &Arc<Self>, port: u16) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "registry listening");
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let dispatcher = Arc::new(Dispatcher::for_owner(self.clone(), REGISTRY_TAGS));
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                tracing::debug!(%remote, error = %e, "failed to enable keepalive");
            }
            match Connection::spawn(stream, dispatcher.clone()) {
                Ok(_) => tracing::debug!(%remote, "node connected"),
                Err(e) => tracing::warn!(%remote, error = %e, "failed to start connection"),
            }
        }
    }

    /// Admit a node. Ids are handed out densely in call order.
    pub fn register(&self, item: RegisterItem) -> Result<NodeId, RegistrationError> {
        self.lock().register(item)
    }

    fn handle_register(&self, conn: &Connection, addr: Ipv4Addr, port: u16) -> anyhow::Result<()> {
        let mut state = self.lock();
        let outcome = if conn.peer_id() >= 0 {
            Err(RegistrationError::AlreadyRegistered)
        } else {
            state.register(RegisterItem::new(addr, port))
        };

        let reply = match outcome {
            Ok(id) => {
                conn.set_peer_id(id);
                self.cache.insert(id, conn.clone());
                let count = state.items.len();
                tracing::info!(peer = id, %addr, port, count, "node registered");
                Message::RegisterStatus {
                    id,
                    message: format!(
                        "Registration request successful. There are currently ({count}) nodes constituting the overlay."
                    ),
                }
            }
            Err(e) => {
                tracing::warn!(%addr, port, remote = %conn.remote_addr(), error = %e, "registration rejected");
                Message::RegisterStatus {
                    id: overlay_core::wire::UNASSIGNED_ID,
                    message: e.to_string(),
                }
            }
        };
        conn.send(&reply).context("failed to queue REGISTER_STATUS")?;
        Ok(())
    }

    /// Compute every node's routing table with `manifest_size` links each and
    /// push the manifests. Returns how many manifests were queued.
    pub fn build_topology(&self, manifest_size: u32) -> usize {
        let mut state = self.lock();
        if state.items.is_empty() {
            tracing::info!("no nodes registered, nothing to set up");
            return 0;
        }

        let tables = topology::compute_routing_tables(&state.items, manifest_size);
        let members = state.members();
        let mut sent = 0;
        for (id, table) in members.iter().zip(&tables) {
            let manifest = Message::Manifest {
                routes: table.clone(),
                members: members.clone(),
            };
            match self.cache.send_to(*id, &manifest) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(peer = *id, error = %e, "manifest not sent"),
            }
        }
        for item in &mut state.items {
            item.ready = false;
        }
        state.manifests = tables;

        tracing::info!(nodes = members.len(), manifest_size, sent, "overlay set up");
        sent
    }

    /// Start a round: clear completion state and broadcast TASK_INITIATE.
    /// Returns how many nodes were told.
    pub fn start_task_round(&self, packets: u32) -> usize {
        let mut state = self.lock();
        if state.manifests.is_empty() {
            tracing::warn!("starting a round before the overlay was set up");
        }
        for item in &mut state.items {
            item.complete = false;
        }
        state.round = Round {
            packets: Some(packets),
            ..Round::default()
        };
        self.reports.send_replace(None);
        let told = self.cache.broadcast(&Message::TaskInitiate { packets });
        tracing::info!(packets, nodes = told, "task round started");
        told
    }

    /// Record a node's link setup outcome. `id` is −1 when setup failed.
    pub fn on_setup_status(&self, id: NodeId, message: &str) -> anyhow::Result<()> {
        if id < 0 {
            tracing::warn!(status = message, "node failed to set up its overlay links");
            return Ok(());
        }
        let mut state = self.lock();
        let Some(item) = state.item_mut(id) else {
            bail!("setup status for unknown node {id}");
        };
        item.ready = true;
        tracing::info!(peer = id, status = message, "node overlay links up");
        if state.items.iter().all(|item| item.ready) {
            tracing::info!(nodes = state.items.len(), "all nodes ready for a task round");
        }
        Ok(())
    }

    /// Mark a node complete. Once every registered node is complete the
    /// summary request goes out, exactly once per round. Returns true if this
    /// call sent it.
    pub fn on_task_finished(&self, id: NodeId, counters: TrafficCounters) -> anyhow::Result<bool> {
        let mut state = self.lock();
        let Some(item) = state.item_mut(id) else {
            bail!("task finished for unknown node {id}");
        };
        item.complete = true;
        tracing::info!(peer = id, sent = counters.sent, "node finished its task");

        if state.round.summary_requested || !state.items.iter().all(|item| item.complete) {
            return Ok(false);
        }
        state.round.summary_requested = true;
        self.summary_broadcasts.fetch_add(1, Ordering::AcqRel);
        let told = self.cache.broadcast(&Message::SummaryRequest);
        tracing::info!(nodes = told, "all nodes finished, requesting traffic summaries");
        Ok(true)
    }

    /// Store a node's summary for the current round. The report is published
    /// once every registered node has answered, and published again whenever
    /// a node follows up with counters for packets that were still in flight.
    pub fn on_traffic_summary(&self, id: NodeId, counters: TrafficCounters) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.item_mut(id).is_none() {
            bail!("traffic summary from unknown node {id}");
        }
        if !state.round.summary_requested {
            tracing::debug!(peer = id, "traffic summary outside a collection, ignored");
            return Ok(());
        }
        let expected = state.items.len();
        let round = &mut state.round;
        round.summaries.retain(|(node, _)| *node != id);
        round.summaries.push((id, counters));

        if round.summaries.len() == expected {
            let report = TrafficReport::from_rows(state.round.summaries.clone());
            if report.is_balanced() {
                tracing::info!(
                    nodes = report.rows.len(),
                    sent = report.total.sent,
                    relayed = report.total.relayed,
                    received = report.total.received,
                    "traffic summary complete"
                );
            } else {
                tracing::debug!(
                    sent = report.total.sent,
                    received = report.total.received,
                    "traffic totals do not balance yet"
                );
            }
            self.reports.send_replace(Some(report));
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn registered_count(&self) -> usize {
        self.lock().items.len()
    }

    pub fn list_nodes(&self) -> Vec<NodeStatus> {
        self.lock()
            .items
            .iter()
            .filter_map(|item| {
                let id = item.id?;
                Some(NodeStatus {
                    id,
                    addr: item.addr,
                    port: item.port,
                    ready: item.ready,
                    complete: item.complete,
                    stale: self.cache.get(id).map_or(true, |conn| !conn.is_open()),
                })
            })
            .collect()
    }

    /// Routing tables from the last topology build, by node id.
    pub fn routing_tables(&self) -> Vec<(NodeId, RoutingTable)> {
        self.lock()
            .manifests
            .iter()
            .enumerate()
            .map(|(id, table)| (id as NodeId, table.clone()))
            .collect()
    }

    /// Packet count of the current round, if one was started.
    pub fn current_round(&self) -> Option<u32> {
        self.lock().round.packets
    }

    /// How many SUMMARY_REQUEST broadcasts have gone out in total.
    pub fn summary_broadcasts(&self) -> usize {
        self.summary_broadcasts.load(Ordering::Acquire)
    }

    /// The latest report for the current round, once every node answered.
    pub fn traffic_report(&self) -> Option<TrafficReport> {
        self.reports.borrow().clone()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<TrafficReport>> {
        self.reports.subscribe()
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }
}

impl EventHandler for Registry {
    fn handle(&self, conn: &Connection, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Register { addr, port } => self.handle_register(conn, addr, port),
            Message::SetupStatus { id, message } if id < 0 => {
                tracing::warn!(peer = conn.peer_id(), status = %message, "node failed to set up its overlay links");
                Ok(())
            }
            Message::SetupStatus { id, message } => {
                expect_sender(conn, id)?;
                self.on_setup_status(id, &message)
            }
            Message::TaskFinished { id, counters } => {
                expect_sender(conn, id)?;
                self.on_task_finished(id, counters).map(|_| ())
            }
            Message::TrafficSummary { id, counters } => {
                expect_sender(conn, id)?;
                self.on_traffic_summary(id, counters)
            }
            other => bail!("unexpected {:?} on a registry link", other.tag()),
        }
    }

    fn connection_lost(&self, conn: &Connection) {
        let peer = conn.peer_id();
        if peer < 0 {
            tracing::debug!(remote = %conn.remote_addr(), "unregistered connection closed");
        } else {
            tracing::warn!(peer, remote = %conn.remote_addr(), "lost connection to node, entry is now stale");
        }
    }
}

/// A node may only report for itself.
fn expect_sender(conn: &Connection, id: NodeId) -> anyhow::Result<()> {
    if conn.peer_id() != id {
        bail!("node {} reported as {id}", conn.peer_id());
    }
    Ok(())
}
