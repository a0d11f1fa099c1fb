//! Basic connection server.
//!
//! Demonstrates:
//! - Building and starting a server
//! - Observing `Established` / `Lost` events
//! - Routing inbound packets by kind
//! - Periodic broadcast to every primary and secondary
//! - Graceful shutdown
//!
//! Usage:
//!   cargo run --example basic_server
//!   cargo run --example basic_server -- --port=9000
//!   cargo run --example basic_server -- --debug
//!   cargo run --example basic_server -- --tertiary
//!
//! Connect a WebSocket client to `ws://127.0.0.1:7777` and send
//! `{"type":"packet","kind":"chat","payload":"hi"}`. Send
//! `{"type":"secondaryRequest","port":<your udp port>}` to open a UDP
//! companion channel.

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use common::Args;
use connection_hub::{Connection, ConnectionServer, Packet, TransportKind};
use serde_json::json;

// ============================================================================
// Constants
// ============================================================================

const TICK_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== Basic Server ===\n");

    // ========================================================================
    // Start Server
    // ========================================================================

    println!("[1] Starting server on port {}...", args.port);

    let server = ConnectionServer::builder()
        .port(args.port)
        .secondary_limit(2)
        .allow_tertiary(args.tertiary)
        .spawn()
        .await?;

    println!("    ✓ {server}\n");

    // ========================================================================
    // Events
    // ========================================================================

    println!("[2] Subscribing to events...");

    server.on_established(|connection, kind| {
        println!("    + {kind} {} from {:?}", connection.id(), connection.peer_addr());
    });
    server.on_lost(|connection, kind, reason| {
        println!("    - {kind} {} ({reason})", connection.id());
    });

    server.register_packet_handler(
        "chat",
        Arc::new(|id, packet: Packet| {
            println!("    > {id}: {}", packet.payload);
        }),
    );

    println!("    ✓ Ready\n");

    // ========================================================================
    // Broadcast
    // ========================================================================

    println!("[3] Broadcasting a tick every {}s...\n", TICK_INTERVAL.as_secs());

    let ticker = server.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        let mut sequence = 0u64;
        loop {
            interval.tick().await;
            sequence += 1;

            let packet = Packet::new("tick", json!({ "sequence": sequence }));
            for kind in [TransportKind::Primary, TransportKind::Secondary] {
                let report = ticker.broadcast(kind, &packet);
                if report.delivered + report.skipped > 0 {
                    println!(
                        "    ~ tick {sequence} to {kind}: {} delivered, {} skipped",
                        report.delivered, report.skipped
                    );
                }
            }
        }
    });

    common::wait_for_exit(args.no_wait).await;

    // ========================================================================
    // Shutdown
    // ========================================================================

    println!("\n[4] Shutting down...");

    tick_task.abort();
    server.shutdown().await;

    println!("    ✓ {server}");
    println!("\n=== Done ===");
    Ok(())
}
