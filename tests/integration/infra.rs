use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::TcpStream;

use overlay_core::config::NodeConfig;
use overlay_core::frame::{self, read_frame, send_frame, FramedLink};
use overlay_core::{Message, NodeId, TrafficCounters};
use overlayd::{MessagingNode, Registry, TrafficReport};

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

// ── Processes ─────────────────────────────────────────────────────────────────

/// A listening registry and the loopback address nodes should dial.
pub async fn start_registry() -> Result<(Arc<Registry>, SocketAddr)> {
    let registry = Registry::new();
    let bound = registry
        .start_listening(0)
        .await
        .context("registry failed to listen")?;
    Ok((registry, SocketAddr::from((Ipv4Addr::LOCALHOST, bound.port()))))
}

/// Join `count` messaging nodes one after another, so ids follow join order.
pub async fn join_nodes(registry: SocketAddr, count: usize, seed: u64) -> Result<Vec<Arc<MessagingNode>>> {
    let config = NodeConfig {
        seed,
        ..NodeConfig::default()
    };
    let mut nodes = Vec::with_capacity(count);
    for n in 0..count {
        let node = tokio::time::timeout(TIMEOUT, MessagingNode::join(registry, &config))
            .await
            .with_context(|| format!("node {n} timed out joining"))?
            .with_context(|| format!("node {n} failed to join"))?;
        nodes.push(node);
    }
    Ok(nodes)
}

/// Poll `check` until it holds or TIMEOUT passes.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) -> Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Set up `manifest_size` links per node and wait until every node is ready.
pub async fn set_up_overlay(registry: &Registry, manifest_size: u32) -> Result<()> {
    registry.build_topology(manifest_size);
    eventually("every node ready", || {
        registry.list_nodes().iter().all(|n| n.ready)
    })
    .await
}

/// Wait for this round's report to account for all `sent` packets.
pub async fn balanced_report(registry: &Registry, sent: u32) -> Result<TrafficReport> {
    let mut reports = registry.subscribe_reports();
    let report = tokio::time::timeout(
        TIMEOUT,
        reports.wait_for(|report| {
            report
                .as_ref()
                .is_some_and(|r| r.total.sent == sent && r.is_balanced())
        }),
    )
    .await
    .with_context(|| format!("no balanced report for {sent} packets, last: {:?}", registry.traffic_report().map(|r| r.total)))??
    .clone();
    report.context("report vanished")
}

/// Sum of every node's counters.
pub fn total_counters(nodes: &[Arc<MessagingNode>]) -> TrafficCounters {
    let mut total = TrafficCounters::default();
    for node in nodes {
        total.accumulate(&node.counters());
    }
    total
}

// ── Raw protocol peer ─────────────────────────────────────────────────────────

/// A peer that speaks the wire protocol by hand, so tests control exactly
/// what the registry sees and when.
pub struct RawPeer {
    stream: FramedLink<TcpStream>,
}

impl RawPeer {
    pub async fn connect(registry: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(registry)
            .await
            .context("raw peer failed to connect")?;
        Ok(Self {
            stream: frame::framed(stream),
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        send_frame(&mut self.stream, message.encode()).await?;
        Ok(())
    }

    /// Send an arbitrary frame payload.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<()> {
        send_frame(&mut self.stream, Bytes::copy_from_slice(payload)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message> {
        let frame = tokio::time::timeout(TIMEOUT, read_frame(&mut self.stream))
            .await
            .context("timed out waiting for a frame")??;
        Ok(Message::decode(&frame)?)
    }

    /// Some(message) if one arrives within `wait`, None otherwise.
    pub async fn recv_within(&mut self, wait: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(wait, read_frame(&mut self.stream)).await {
            Ok(frame) => Ok(Some(Message::decode(&frame?)?)),
            Err(_) => Ok(None),
        }
    }

    /// Send REGISTER and return the (id, message) of the answer.
    pub async fn register(&mut self, port: u16) -> Result<(NodeId, String)> {
        self.send(&Message::Register {
            addr: Ipv4Addr::LOCALHOST,
            port,
        })
        .await?;
        match self.recv().await? {
            Message::RegisterStatus { id, message } => Ok((id, message)),
            other => bail!("expected REGISTER_STATUS, got {other:?}"),
        }
    }
}

/// Register `count` raw peers in order. Peer i advertises port 40000 + i.
pub async fn register_raw_peers(registry: SocketAddr, count: u16) -> Result<Vec<RawPeer>> {
    let mut peers = Vec::new();
    for i in 0..count {
        let mut peer = RawPeer::connect(registry).await?;
        let (id, message) = peer.register(40000 + i).await?;
        if id != NodeId::from(i) {
            bail!("peer {i} got id {id}: {message}");
        }
        peers.push(peer);
    }
    Ok(peers)
}
