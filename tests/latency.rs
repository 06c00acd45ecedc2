//! Pair-latency stability and clogging windows.

use std::net::Ipv4Addr;
use std::time::Duration;

use riptide::{
    ClogMode, Knobs, LocalityData, ProcessClass, Simulation, SimulationError, TaskPriority,
};

const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn lossy_knobs() -> Knobs {
    Knobs {
        max_clogging_latency: 0.05,
        ..Knobs::default()
    }
}

#[test]
fn pair_latency_is_stable_across_connections() {
    init_tracing();
    Simulation::with_seed(2001)
        .knobs(lossy_knobs())
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = sim.new_process(
                "a",
                IP_A,
                1,
                LocalityData::for_zone("z-a"),
                ProcessClass::Storage,
                "",
                "",
            );
            let b = sim.new_process(
                "b",
                IP_B,
                1,
                LocalityData::for_zone("z-b"),
                ProcessClass::Storage,
                "",
                "",
            );
            let addr_b = sim.process_address(b);

            let accept_sim = sim.clone();
            let acceptor = tokio::task::spawn_local(async move {
                accept_sim.on_process(b, TaskPriority::DefaultDelay).await?;
                let listener = accept_sim.listen(addr_b);
                for _ in 0..2 {
                    let conn = listener.accept().await?;
                    // Drain to end-of-stream so the connector finishes
                    // with the pair before this end closes.
                    loop {
                        conn.on_readable().await?;
                        let mut buf = [0u8; 8];
                        if conn.read(&mut buf)? == 0 {
                            break;
                        }
                    }
                    conn.close();
                }
                Ok::<(), SimulationError>(())
            });

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let first = sim.connect(addr_b).await?;
            let drawn = sim
                .pair_latency(IP_A, IP_B)
                .expect("pair latency drawn at first contact");
            assert!((0.0..0.05).contains(&drawn));
            first.close();

            let second = sim.connect(addr_b).await?;
            assert_eq!(sim.pair_latency(IP_A, IP_B), Some(drawn));
            second.close();

            // Both successive delivery samples include the same permanent
            // baseline when no clog window is active.
            for _ in 0..2 {
                let recv = sim.recv_delay_seconds(IP_A, IP_B);
                assert!(recv >= drawn);
                assert!(recv <= drawn + 0.06);
            }

            acceptor
                .await
                .map_err(|_| SimulationError::InvalidState("join".to_string()))??;
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn send_clog_delays_sends_until_the_window_passes() {
    init_tracing();
    Simulation::with_seed(2002)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            sim.clog_send_for(IP_A, 10.0);

            // Traffic originating at A is held back by the full window.
            let clogged = sim.send_delay_seconds(IP_B, IP_A);
            assert!(clogged >= 10.0);

            // The reverse direction is unaffected.
            let reverse = sim.send_delay_seconds(IP_A, IP_B);
            assert!(reverse < 1.0);

            // Once virtual time passes the window, delays are small again.
            sim.delay(Duration::from_secs(11), TaskPriority::DefaultDelay)
                .await?;
            let after = sim.send_delay_seconds(IP_B, IP_A);
            assert!(after < 1.0);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn recv_clog_does_not_affect_pure_send_timing() {
    init_tracing();
    Simulation::with_seed(2003)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            sim.clog_recv_for(IP_A, 10.0);

            let send = sim.send_delay_seconds(IP_B, IP_A);
            assert!(send < 1.0, "receive clogs must not delay the send leg");

            let recv = sim.recv_delay_seconds(IP_B, IP_A);
            assert!(recv >= 10.0);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn clog_windows_extend_not_replace() {
    init_tracing();
    Simulation::with_seed(2004)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            sim.clog_send_for(IP_A, 10.0);
            sim.clog_send_for(IP_A, 2.0);
            assert!(sim.send_delay_seconds(IP_B, IP_A) >= 10.0);

            sim.clog_pair(IP_B, IP_A, 20.0);
            assert!(sim.recv_delay_seconds(IP_B, IP_A) >= 20.0);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn clog_interface_modes() {
    init_tracing();
    Simulation::with_seed(2005)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            sim.clog_interface(IP_A, 5.0, ClogMode::All);
            assert!(sim.send_delay_seconds(IP_B, IP_A) >= 5.0);
            assert!(sim.recv_delay_seconds(IP_B, IP_A) >= 5.0);
            Ok(())
        })
        .expect("simulation");
}

#[test]
fn speed_up_mode_skips_clogging() {
    init_tracing();
    Simulation::with_seed(2006)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            sim.clog_send_for(IP_A, 100.0);
            sim.set_speed_up_simulation(true);
            assert!(sim.send_delay_seconds(IP_B, IP_A) < 1.0);
            Ok(())
        })
        .expect("simulation");
}
