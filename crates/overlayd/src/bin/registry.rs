//! registry: admits messaging nodes and coordinates the overlay.
//!
//! Usage: registry [port]

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use overlay_core::config::OverlayConfig;
use overlayd::command::RegistryCommand;
use overlayd::Registry;

/// How long queued frames get to reach the nodes on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    overlayd::init_tracing();

    let mut config = OverlayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        OverlayConfig::default()
    });
    if let Some(port) = std::env::args().nth(1) {
        config.registry.port = port
            .parse()
            .with_context(|| format!("invalid port {port:?}"))?;
    }

    let registry = Registry::new();
    let addr = registry
        .start_listening(config.registry.port)
        .await
        .with_context(|| format!("failed to listen on port {}", config.registry.port))?;
    println!("registry listening on {addr}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            tracing::info!("stdin closed, running until interrupted");
            tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<RegistryCommand>() {
            Ok(RegistryCommand::Quit) => break,
            Ok(command) => run(&registry, command),
            Err(e) => println!("{e}\n{}", RegistryCommand::USAGE),
        }
    }

    tracing::info!("registry shutting down");
    registry.cache().shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn run(registry: &Registry, command: RegistryCommand) {
    match command {
        RegistryCommand::ListMessagingNodes => {
            let nodes = registry.list_nodes();
            if nodes.is_empty() {
                println!("no messaging nodes registered");
            }
            for node in nodes {
                println!("{node}");
            }
        }
        RegistryCommand::SetupOverlay { manifest_size } => {
            let sent = registry.build_topology(manifest_size);
            println!("sent {sent} manifests with {manifest_size} links per node");
        }
        RegistryCommand::ListRoutingTables => {
            let tables = registry.routing_tables();
            if tables.is_empty() {
                println!("overlay not set up yet");
            }
            for (id, table) in tables {
                print!("node {id}\n{table}");
            }
        }
        RegistryCommand::Start { packets } => {
            let told = registry.start_task_round(packets);
            println!("task round of {packets} packets started on {told} nodes");
        }
        RegistryCommand::PrintTrafficSummary => match registry.traffic_report() {
            Some(report) => print!("{report}"),
            None => println!("no complete traffic summary yet"),
        },
        RegistryCommand::Help => println!("{}", RegistryCommand::USAGE),
        RegistryCommand::Quit => {}
    }
}
