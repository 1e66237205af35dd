use std::time::Duration;

use overlay_core::{Message, TrafficCounters};

use crate::*;

/// SUMMARY_REQUEST goes out once, right after the fourth TASK_FINISHED.
#[tokio::test]
async fn test_summary_request_after_last_finish() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 4).await?;

    assert_eq!(registry.start_task_round(10), 4);
    for peer in &mut peers {
        assert_eq!(peer.recv().await?, Message::TaskInitiate { packets: 10 });
    }

    for (id, peer) in peers.iter_mut().enumerate().take(3) {
        peer.send(&Message::TaskFinished {
            id: id as i32,
            counters: TrafficCounters::default(),
        })
        .await?;
    }
    eventually("three nodes complete", || {
        registry.list_nodes().iter().filter(|n| n.complete).count() == 3
    })
    .await?;
    assert_eq!(registry.summary_broadcasts(), 0);
    assert_eq!(peers[0].recv_within(Duration::from_millis(200)).await?, None);

    peers[3]
        .send(&Message::TaskFinished {
            id: 3,
            counters: TrafficCounters::default(),
        })
        .await?;
    for peer in &mut peers {
        assert_eq!(peer.recv().await?, Message::SummaryRequest);
    }
    assert_eq!(registry.summary_broadcasts(), 1);

    // A late duplicate does not trigger a second broadcast.
    peers[1]
        .send(&Message::TaskFinished {
            id: 1,
            counters: TrafficCounters::default(),
        })
        .await?;
    assert_eq!(peers[0].recv_within(Duration::from_millis(200)).await?, None);
    assert_eq!(registry.summary_broadcasts(), 1);
    Ok(())
}

/// Four peers finishing at the same moment still produce one broadcast.
#[tokio::test]
async fn test_simultaneous_finishes() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let peers = register_raw_peers(addr, 4).await?;
    registry.start_task_round(1);

    let mut tasks = Vec::new();
    for (id, mut peer) in peers.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            assert_eq!(peer.recv().await?, Message::TaskInitiate { packets: 1 });
            peer.send(&Message::TaskFinished {
                id: id as i32,
                counters: TrafficCounters::default(),
            })
            .await?;
            assert_eq!(peer.recv().await?, Message::SummaryRequest);
            anyhow::Ok(peer)
        }));
    }
    let mut peers = Vec::new();
    for task in tasks {
        peers.push(task.await??);
    }

    assert_eq!(registry.summary_broadcasts(), 1);
    assert_eq!(peers[2].recv_within(Duration::from_millis(200)).await?, None);
    Ok(())
}

/// A node may only report completion for itself.
#[tokio::test]
async fn test_finish_for_another_node_is_ignored() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let mut peers = register_raw_peers(addr, 2).await?;
    registry.start_task_round(1);

    peers[0]
        .send(&Message::TaskFinished {
            id: 1,
            counters: TrafficCounters::default(),
        })
        .await?;
    peers[0]
        .send(&Message::TaskFinished {
            id: 0,
            counters: TrafficCounters::default(),
        })
        .await?;
    eventually("node 0 complete", || {
        registry.list_nodes().iter().any(|n| n.id == 0 && n.complete)
    })
    .await?;
    assert!(!registry.list_nodes()[1].complete);
    assert_eq!(registry.summary_broadcasts(), 0);
    Ok(())
}

/// A full round over real nodes: every packet generated is delivered, the
/// payload sums agree and the registry publishes a balanced report.
#[tokio::test]
async fn test_full_round_with_real_nodes() -> anyhow::Result<()> {
    const PACKETS: u32 = 500;

    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 6, 7).await?;
    set_up_overlay(&registry, 2).await?;

    assert_eq!(registry.start_task_round(PACKETS), 6);
    let report = balanced_report(&registry, 6 * PACKETS).await?;
    assert_eq!(registry.summary_broadcasts(), 1);
    assert_eq!(report.rows.len(), 6);
    assert_eq!(report.total.received, 6 * PACKETS);
    assert_eq!(report.total.sum_received, report.total.sum_sent);
    // With two links per node on a ring of six, some packets need a relay.
    assert!(report.total.relayed > 0);

    for (node, (id, row)) in nodes.iter().zip(&report.rows) {
        let counters = node.counters();
        assert_eq!(node.id(), *id);
        assert_eq!(row.sent, PACKETS);
        assert_eq!((row.received, row.sum_received), (counters.received, counters.sum_received));
    }
    Ok(())
}

/// With one link per node most packets take several hops and are still in
/// flight when the summary request goes out; the report catches up.
#[tokio::test]
async fn test_report_includes_packets_in_flight_at_summary_time() -> anyhow::Result<()> {
    const PACKETS: u32 = 1000;

    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 10, 21).await?;
    set_up_overlay(&registry, 1).await?;

    registry.start_task_round(PACKETS);
    let report = balanced_report(&registry, 10 * PACKETS).await?;
    assert_eq!(report.total.received, 10 * PACKETS);
    assert!(report.total.relayed >= report.total.received);

    // Relay counts trail the last deliveries by at most one follow-up.
    eventually("relay counts reported", || {
        registry
            .traffic_report()
            .is_some_and(|r| r.total == total_counters(&nodes))
    })
    .await?;
    Ok(())
}

/// Neighbors start generating before a node has seen its own TASK_INITIATE;
/// those packets still count toward the round, round after round.
#[tokio::test]
async fn test_early_packets_are_counted_in_their_round() -> anyhow::Result<()> {
    const NODES: usize = 40;
    const PACKETS: u32 = 200;

    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, NODES, 5).await?;
    set_up_overlay(&registry, 6).await?;

    for round in 1..=4 {
        registry.start_task_round(PACKETS);
        let report = balanced_report(&registry, NODES as u32 * PACKETS).await?;
        assert_eq!(registry.summary_broadcasts(), round);

        let total = total_counters(&nodes);
        assert_eq!(total.sent, total.received, "round {round}");
        assert_eq!(total.sum_sent, total.sum_received, "round {round}");
        assert_eq!(total.sum_sent, report.total.sum_sent, "round {round}");
    }
    Ok(())
}

/// Generated traffic depends only on the seed and the overlay.
#[tokio::test]
async fn test_rounds_are_deterministic() -> anyhow::Result<()> {
    async fn sums(seed: u64) -> anyhow::Result<Vec<i64>> {
        let (registry, addr) = start_registry().await?;
        let nodes = join_nodes(addr, 4, seed).await?;
        set_up_overlay(&registry, 2).await?;
        registry.start_task_round(50);
        eventually("round finished", || registry.summary_broadcasts() == 1).await?;
        Ok(nodes.iter().map(|n| n.counters().sum_sent).collect())
    }

    assert_eq!(sums(11).await?, sums(11).await?);
    assert_ne!(sums(11).await?, sums(12).await?);
    Ok(())
}

/// Counters start over with each round, and each round gets its own
/// summary request.
#[tokio::test]
async fn test_second_round_resets_counters() -> anyhow::Result<()> {
    let (registry, addr) = start_registry().await?;
    let nodes = join_nodes(addr, 4, 3).await?;
    registry.build_topology(2);
    eventually("ready", || registry.list_nodes().iter().all(|n| n.ready)).await?;

    registry.start_task_round(100);
    eventually("first round", || {
        registry.summary_broadcasts() == 1 && total_counters(&nodes).received == 400
    })
    .await?;

    registry.start_task_round(20);
    eventually("second round", || {
        registry.summary_broadcasts() == 2 && total_counters(&nodes).received == 80
    })
    .await?;
    for node in &nodes {
        assert_eq!(node.counters().sent, 20);
    }
    Ok(())
}
