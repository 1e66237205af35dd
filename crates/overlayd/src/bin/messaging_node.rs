//! messaging-node: joins the overlay through the registry.
//!
//! Usage: messaging-node [registry-host registry-port]
//!
//! Exits with status 1 if the registry link is lost.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use overlay_core::config::OverlayConfig;
use overlayd::command::NodeCommand;
use overlayd::MessagingNode;

#[tokio::main]
async fn main() -> Result<()> {
    overlayd::init_tracing();

    let mut config = OverlayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        OverlayConfig::default()
    });
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [host, port] => {
            config.registry.host = host.clone();
            config.registry.port = port
                .parse()
                .with_context(|| format!("invalid registry port {port:?}"))?;
        }
        _ => anyhow::bail!("usage: messaging-node [registry-host registry-port]"),
    }

    let registry = resolve(&config.registry.host, config.registry.port).await?;
    let node = MessagingNode::join(registry, &config.node)
        .await
        .with_context(|| format!("failed to join the overlay at {registry}"))?;
    println!("registered as node {} ({})", node.id(), node.advertised_addr());

    let mut lost = node.registry_lost();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<NodeCommand>() {
                        Ok(NodeCommand::Quit) => break,
                        Ok(NodeCommand::PrintCountersAndDiagnostics) => println!("{}", node.diagnostics()),
                        Ok(NodeCommand::Help) => println!("{}", NodeCommand::USAGE),
                        Err(e) => println!("{e}\n{}", NodeCommand::USAGE),
                    },
                    None => stdin_open = false,
                }
            }
            changed = lost.changed() => {
                if changed.is_err() || *lost.borrow() {
                    tracing::error!(peer = node.id(), "registry link lost, exiting");
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown();
    Ok(())
}

/// First IPv4 address of `host:port`.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}"))?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("{host} has no IPv4 address"))
}
