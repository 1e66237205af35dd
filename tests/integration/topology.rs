use overlay_core::{Message, NodeId};

use crate::*;

fn manifest_neighbors(message: &Message) -> (Vec<NodeId>, Vec<NodeId>) {
    match message {
        Message::Manifest { routes, members } => (routes.neighbor_ids(), members.clone()),
        other => panic!("expected MANIFEST, got {other:?}"),
    }
}

/// Four nodes with two links each: node 0 gets {1, 2}, node 3 gets {0, 1}.
#[tokio::test]
async fn test_manifests_for_four_nodes() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 4).await?;

    assert_eq!(registry.build_topology(2), 4);

    let mut manifests = Vec::new();
    for peer in &mut peers {
        manifests.push(manifest_neighbors(&peer.recv().await?));
    }
    assert_eq!(manifests[0].0, vec![1, 2]);
    assert_eq!(manifests[1].0, vec![2, 3]);
    assert_eq!(manifests[2].0, vec![3, 0]);
    assert_eq!(manifests[3].0, vec![0, 1]);
    for (_, members) in &manifests {
        assert_eq!(members, &vec![0, 1, 2, 3]);
    }

    // Routes carry what each peer advertised.
    let tables = registry.routing_tables();
    let route = tables[3].1.get(0).expect("node 3 routes to node 0");
    assert_eq!(route.port, 40000);
    Ok(())
}

/// Small overlays never contain self routes or repeats.
#[tokio::test]
async fn test_three_nodes_large_manifest() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 3).await?;

    assert_eq!(registry.build_topology(5), 3);
    for (i, peer) in peers.iter_mut().enumerate() {
        let (neighbors, _) = manifest_neighbors(&peer.recv().await?);
        assert!(!neighbors.contains(&(i as NodeId)));
        let mut unique = neighbors.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), neighbors.len());
        assert_eq!(neighbors.len(), 2);
    }
    Ok(())
}

/// Building an overlay with nobody registered is a no-op.
#[tokio::test]
async fn test_empty_overlay() -> anyhow::Result<()> {
    let (registry, _addr) = start_registry().await?;
    assert_eq!(registry.build_topology(3), 0);
    assert!(registry.routing_tables().is_empty());
    Ok(())
}

/// Real nodes link up with their neighbors and report ready.
#[tokio::test]
async fn test_nodes_link_up_and_report_ready() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 5, 0).await?;

    assert_eq!(registry.build_topology(2), 5);
    eventually("every node ready", || {
        registry.list_nodes().iter().all(|n| n.ready)
    })
    .await?;

    for node in &nodes {
        let id = node.id();
        let expected = vec![(id + 1) % 5, (id + 2) % 5];
        assert_eq!(node.routing_table().neighbor_ids(), expected);
        assert_eq!(node.members(), vec![0, 1, 2, 3, 4]);
        let mut sorted = expected.clone();
        sorted.sort_unstable();
        eventually("links up", || node.links_up() == sorted).await?;
    }

    // Setting up again replaces the links rather than adding to them.
    assert_eq!(registry.build_topology(1), 5);
    eventually("single links", || {
        nodes.iter().all(|n| n.links_up() == vec![(n.id() + 1) % 5])
    })
    .await?;
    Ok(())
}

/// A node may only report its own link setup; a failure is logged, not
/// recorded against anyone.
#[tokio::test]
async fn test_setup_status_for_another_node_is_ignored() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 2).await?;

    peers[0]
        .send(&Message::SetupStatus {
            id: 1,
            message: "Node 1 established 1 overlay links".into(),
        })
        .await?;
    peers[1]
        .send(&Message::SetupStatus {
            id: -1,
            message: "Node 1 could not link to [0]".into(),
        })
        .await?;
    peers[0]
        .send(&Message::SetupStatus {
            id: 0,
            message: "Node 0 established 1 overlay links".into(),
        })
        .await?;

    eventually("node 0 ready", || {
        registry.list_nodes().iter().any(|n| n.id == 0 && n.ready)
    })
    .await?;
    assert!(!registry.list_nodes()[1].ready);
    Ok(())
}
