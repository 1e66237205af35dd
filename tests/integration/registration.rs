use std::time::Duration;

use overlay_core::Message;
use overlayd::PeerError;

use crate::*;

/// Four peers connecting one after another get ids 0..3 in order.
#[tokio::test]
async fn test_sequential_ids() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;

    let mut peers = Vec::new();
    let mut last = String::new();
    for i in 0..4u16 {
        let mut peer = RawPeer::connect(addr).await?;
        let (id, message) = peer.register(41000 + i).await?;
        assert_eq!(id, i32::from(i));
        last = message;
        peers.push(peer);
    }
    assert_eq!(
        last,
        "Registration request successful. There are currently (4) nodes constituting the overlay."
    );
    assert_eq!(registry.registered_count(), 4);
    assert_eq!(registry.cache().ids(), vec![0, 1, 2, 3]);
    Ok(())
}

/// A duplicate address+port is refused with id −1 and the link stays usable.
#[tokio::test]
async fn test_duplicate_registration_keeps_link_open() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;

    let mut first = RawPeer::connect(addr).await?;
    assert_eq!(first.register(42000).await?.0, 0);

    let mut second = RawPeer::connect(addr).await?;
    let (id, message) = second.register(42000).await?;
    assert_eq!(id, -1);
    assert_eq!(message, "This node is already registered");

    // Same socket, different port: the registry still answers it.
    let (id, _) = second.register(42001).await?;
    assert_eq!(id, 1);
    assert_eq!(registry.registered_count(), 2);
    Ok(())
}

/// A connection that already holds an id cannot register again.
#[tokio::test]
async fn test_registered_link_cannot_register_twice() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;

    let mut peer = RawPeer::connect(addr).await?;
    assert_eq!(peer.register(43000).await?.0, 0);
    let (id, message) = peer.register(43001).await?;
    assert_eq!(id, -1);
    assert_eq!(message, "This node is already registered");
    assert_eq!(registry.registered_count(), 1);
    Ok(())
}

/// Real messaging nodes register in join order.
#[tokio::test]
async fn test_nodes_join_in_order() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 4, 0).await?;

    let ids: Vec<_> = nodes.iter().map(|n| n.id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let listed = registry.list_nodes();
    assert_eq!(listed.len(), 4);
    for (status, node) in listed.iter().zip(&nodes) {
        assert_eq!(status.port, node.advertised_addr().port());
        assert!(!status.stale);
    }
    Ok(())
}

/// Garbage on a link is dropped and the link keeps working.
#[tokio::test]
async fn test_undecodable_frame_is_skipped() -> anyhow::Result<()> {
    let (_registry, addr) = start_registry().await?;
    let mut peer = RawPeer::connect(addr).await?;

    let mut stranger = RawPeer::connect(addr).await?;
    stranger.send_raw(&[0xee, 0, 1]).await?;
    drop(stranger);

    peer.send_raw(&[0x42]).await?;
    let (id, _) = peer.register(44000).await?;
    assert_eq!(id, 0);
    Ok(())
}

/// A node whose registry goes away is told so.
#[tokio::test]
async fn test_registry_loss_is_signalled_to_nodes() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 2, 0).await?;
    let mut lost = nodes[1].registry_lost();

    registry.cache().close_all();

    tokio::time::timeout(TIMEOUT, lost.wait_for(|lost| *lost)).await??;
    Ok(())
}

/// Dropped nodes stay listed, marked stale.
#[tokio::test]
async fn test_lost_node_is_stale_not_removed() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 2).await?;
    drop(peers.remove(1));

    eventually("node 1 to go stale", || {
        registry.list_nodes().iter().any(|n| n.id == 1 && n.stale)
    })
    .await?;
    assert_eq!(registry.registered_count(), 2);
    assert!(registry.cache().contains(1));

    // The live peer still gets broadcasts.
    assert_eq!(registry.start_task_round(3), 1);
    assert_eq!(
        peers[0].recv_within(Duration::from_secs(5)).await?,
        Some(Message::TaskInitiate { packets: 3 })
    );
    Ok(())
}

/// A full registry turns nodes away with a typed error.
#[tokio::test]
async fn test_full_registry_rejects_node() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    for port in 0..127u16 {
        let item = overlay_core::RegisterItem::new(std::net::Ipv4Addr::new(10, 1, 0, 1), 1000 + port);
        registry.register(item)?;
    }

    match overlayd::MessagingNode::join(addr, &Default::default()).await {
        Err(PeerError::Rejected(message)) => assert_eq!(message, "Registry is full."),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("128th node should be rejected"),
    }
    Ok(())
}
