//! Registry and cascade benchmark suite.
//!
//! Benchmarks the hot paths of connection bookkeeping:
//! - Registering and removing a primary family of N secondaries
//! - Full server cascade (attach, bootstrap, close) through the event hub
//! - Snapshot broadcast over a populated registry
//!
//! Run with: cargo bench --bench registry
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;

use connection_hub::server::ConnectionRegistry;
use connection_hub::{
    CloseReason, Connection, ConnectionCore, ConnectionHandle, ConnectionServer, Packet,
    ServerOptions, TransportKind,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const FAMILY_SIZES: &[usize] = &[1, 8, 64];
const POPULATIONS: &[usize] = &[100, 1_000];

// ============================================================================
// In-Memory Connection
// ============================================================================

#[derive(Debug)]
struct NullConnection {
    core: ConnectionCore,
}

impl NullConnection {
    fn handle(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            core: ConnectionCore::new(kind, None),
        })
    }
}

impl Connection for NullConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn send(&self, packet: &Packet) -> connection_hub::Result<()> {
        black_box(packet);
        Ok(())
    }

    fn close(&self, reason: CloseReason, _notify_remote: bool) {
        self.core.finish(reason);
    }
}

// ============================================================================
// Benchmark: Registry Family
// ============================================================================

fn bench_registry_family(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_family");

    for &size in FAMILY_SIZES {
        group.bench_with_input(BenchmarkId::new("register_unregister", size), &size, |b, &size| {
            let registry = ConnectionRegistry::new();
            b.iter(|| {
                let primary: ConnectionHandle = NullConnection::handle(TransportKind::Primary);
                let id = primary.id();
                let _ = registry.register_primary(primary);
                for _ in 0..size {
                    let secondary = NullConnection::handle(TransportKind::Secondary);
                    let _ = registry.register_secondary(id, secondary, true, size);
                }
                black_box(registry.unregister(id))
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Server Cascade
// ============================================================================

fn bench_server_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_cascade");

    for &size in FAMILY_SIZES {
        let options = ServerOptions::new().with_secondary_limit(size);
        let Ok(server) = ConnectionServer::new(options) else {
            return;
        };
        server.on_lost(|connection, kind, reason| {
            black_box((connection.id(), kind, reason));
        });

        group.bench_with_input(BenchmarkId::new("attach_close", size), &size, |b, &size| {
            b.iter(|| {
                let primary = NullConnection::handle(TransportKind::Primary);
                let _ = server.attach_primary(Arc::clone(&primary) as ConnectionHandle);
                for _ in 0..size {
                    let secondary = NullConnection::handle(TransportKind::Secondary);
                    primary
                        .core()
                        .secondary_established(Arc::clone(&primary) as ConnectionHandle, secondary);
                }
                primary.close(CloseReason::ServerClosed, true);
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Broadcast
// ============================================================================

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let packet = Packet::new("tick", serde_json::json!({ "sequence": 1 }));

    for &population in POPULATIONS {
        let Ok(server) = ConnectionServer::new(ServerOptions::new()) else {
            return;
        };
        let connections: Vec<_> = (0..population)
            .map(|_| NullConnection::handle(TransportKind::Primary))
            .collect();
        for connection in &connections {
            let _ = server.attach_primary(Arc::clone(connection) as ConnectionHandle);
        }

        group.bench_with_input(BenchmarkId::new("primaries", population), &population, |b, _| {
            b.iter(|| black_box(server.broadcast(TransportKind::Primary, &packet)));
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_registry_family, bench_server_cascade, bench_broadcast);
criterion_main!(benches);
