//! End-to-end byte delivery over the simulated connection graph.

use std::net::Ipv4Addr;
use std::time::Duration;

use riptide::{
    LocalityData, ProcessClass, SimWorld, Simulation, SimulationError, SimulationResult,
    TaskPriority,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn storage(sim: &SimWorld, name: &str, ip: [u8; 4], zone: &str) -> riptide::ProcessId {
    sim.new_process(
        name,
        Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
        1,
        LocalityData::for_zone(zone),
        ProcessClass::Storage,
        "",
        "",
    )
}

fn join_err() -> SimulationError {
    SimulationError::InvalidState("task join failed".to_string())
}

#[test]
fn hello_is_delivered_then_eof() {
    init_tracing();
    let metrics = Simulation::with_seed(1001)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = storage(&sim, "a", [10, 0, 0, 1], "z-a");
            let b = storage(&sim, "b", [10, 0, 0, 2], "z-b");
            let addr_b = sim.process_address(b);

            let server_sim = sim.clone();
            let server = tokio::task::spawn_local(async move {
                server_sim.on_process(b, TaskPriority::DefaultDelay).await?;
                let listener = server_sim.listen(addr_b);
                let conn = listener.accept().await?;

                let mut received = Vec::new();
                loop {
                    conn.on_readable().await?;
                    let mut buf = [0u8; 16];
                    let n = conn.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&buf[..n]);
                }
                conn.close();
                Ok::<Vec<u8>, SimulationError>(received)
            });

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let conn = sim.connect(addr_b).await?;
            let payload = b"HELLO";
            let mut sent = 0;
            while sent < payload.len() {
                conn.on_writable().await?;
                sent += conn.write(&payload[sent..], payload.len() - sent)?;
            }
            conn.close();

            let received = server.await.map_err(|_| join_err())??;
            assert_eq!(received, b"HELLO");
            Ok(())
        })
        .expect("simulation");

    assert!(metrics.simulated_time > Duration::ZERO);
}

#[test]
fn accepted_connection_sees_synthesized_peer_address() {
    init_tracing();
    Simulation::with_seed(1002)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = storage(&sim, "a", [10, 0, 0, 1], "z-a");
            let b = storage(&sim, "b", [10, 0, 0, 2], "z-b");
            let addr_a = sim.process_address(a);
            let addr_b = sim.process_address(b);

            let server_sim = sim.clone();
            let server = tokio::task::spawn_local(async move {
                server_sim.on_process(b, TaskPriority::DefaultDelay).await?;
                let listener = server_sim.listen(addr_b);
                let conn = listener.accept().await?;
                let peer = conn.peer_address()?;
                // Hold the endpoint until the connector is done with it.
                conn.on_readable().await?;
                conn.close();
                Ok::<_, SimulationError>(peer)
            });

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let conn = sim.connect(addr_b).await?;
            assert_eq!(conn.peer_address()?, addr_b);
            conn.close();

            let seen = server.await.map_err(|_| join_err())??;
            // Ephemeral-port modeling: the accept side does not see the
            // connector's true listening address.
            assert!((40_000..60_000).contains(&seen.port));
            assert_ne!(seen, addr_a);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn write_respects_peer_flow_control() {
    init_tracing();
    Simulation::with_seed(1003)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = storage(&sim, "a", [10, 0, 0, 1], "z-a");
            let b = storage(&sim, "b", [10, 0, 0, 2], "z-b");
            let addr_b = sim.process_address(b);

            let server_sim = sim.clone();
            let server = tokio::task::spawn_local(async move {
                server_sim.on_process(b, TaskPriority::DefaultDelay).await?;
                let listener = server_sim.listen(addr_b);
                let conn = listener.accept().await?;

                let mut total = 0usize;
                while total < 64 * 1024 {
                    conn.on_readable().await?;
                    let mut buf = [0u8; 4096];
                    let n = conn.read(&mut buf)?;
                    if n == 0 && conn.is_peer_gone() {
                        break;
                    }
                    total += n;
                }
                conn.close();
                Ok::<usize, SimulationError>(total)
            });

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let conn = sim.connect(addr_b).await?;
            let chunk = vec![0xABu8; 4096];
            let mut sent = 0usize;
            while sent < 64 * 1024 {
                conn.on_writable().await?;
                let n = conn.write(&chunk, chunk.len())?;
                // Zero-byte writes mean the window was closed; on_writable
                // must eventually open it again.
                sent += n;
                if n == 0 {
                    sim.yield_now(TaskPriority::DefaultYield).await?;
                }
            }
            conn.close();

            let total = server.await.map_err(|_| join_err())??;
            assert_eq!(total, 64 * 1024);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn connect_polls_until_the_address_exists() {
    init_tracing();
    Simulation::with_seed(1004)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = storage(&sim, "a", [10, 0, 0, 1], "z-a");
            let addr_b = riptide::NetworkAddress::new(Ipv4Addr::new(10, 0, 0, 2), 1);

            // Create the target only after a virtual second has passed.
            let spawn_sim = sim.clone();
            let creator = tokio::task::spawn_local(async move {
                spawn_sim
                    .delay(Duration::from_secs(1), TaskPriority::DefaultDelay)
                    .await?;
                let b = storage(&spawn_sim, "b", [10, 0, 0, 2], "z-b");
                spawn_sim.on_process(b, TaskPriority::DefaultDelay).await?;
                let listener = spawn_sim.listen(addr_b);
                let conn = listener.accept().await?;
                // Wait for the connector to close before tearing down.
                conn.on_readable().await?;
                conn.close();
                Ok::<(), SimulationError>(())
            });

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let conn = sim.connect(addr_b).await?;
            assert!(sim.now() >= Duration::from_secs(1));
            conn.close();

            server_join(creator).await?;
            Ok(())
        })
        .expect("simulation");
}

async fn server_join(
    handle: tokio::task::JoinHandle<SimulationResult<()>>,
) -> SimulationResult<()> {
    handle.await.map_err(|_| join_err())?
}
