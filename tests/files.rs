//! Simulated filesystem behavior: atomic create, shared handles, disk
//! timing, and disk-space accounting.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use riptide::{
    AsyncFile, LocalityData, OpenFlags, ProcessClass, SimWorld, Simulation, SimulationError,
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

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("riptide-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn one_process(sim: &SimWorld) -> riptide::ProcessId {
    sim.new_process(
        "s0",
        Ipv4Addr::new(10, 0, 0, 1),
        1,
        LocalityData::for_zone("zone-0"),
        ProcessClass::Storage,
        "",
        "",
    )
}

#[test]
fn atomic_create_is_invisible_until_sync() {
    init_tracing();
    let dir = scratch_dir("atomic");
    let path = dir.join("X").to_string_lossy().into_owned();

    Simulation::with_seed(4001)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let p = one_process(&sim);
            sim.on_process(p, TaskPriority::DefaultDelay).await?;

            let file = sim
                .open_file(
                    &path,
                    OpenFlags::ATOMIC_WRITE_AND_CREATE
                        | OpenFlags::CREATE
                        | OpenFlags::READWRITE,
                    0o600,
                )
                .await?;
            assert!(file.filename().ends_with(".part"));

            let payload = vec![0x42u8; 1024];
            file.write(&payload, 0).await?;

            // Before sync, the file does not exist under its real name.
            let err = sim
                .open_file(&path, OpenFlags::READONLY, 0)
                .await
                .expect_err("unsynced atomic file must be invisible");
            assert!(matches!(err, SimulationError::FileNotFound(_)));

            file.sync().await?;
            assert_eq!(file.filename(), path);

            let reopened = sim.open_file(&path, OpenFlags::READONLY, 0).await?;
            let mut buf = vec![0u8; 1024];
            let n = reopened.read(&mut buf, 0).await?;
            assert_eq!(n, 1024);
            assert_eq!(buf, payload);
            Ok(())
        })
        .expect("simulation");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn open_files_are_shared_across_the_machine() {
    init_tracing();
    let dir = scratch_dir("shared");
    let path = dir.join("data").to_string_lossy().into_owned();

    Simulation::with_seed(4002)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let a = one_process(&sim);
            let b = sim.new_process(
                "s1",
                Ipv4Addr::new(10, 0, 0, 1),
                2,
                LocalityData::for_zone("zone-0"),
                ProcessClass::Storage,
                "",
                "",
            );

            sim.on_process(a, TaskPriority::DefaultDelay).await?;
            let first = sim
                .open_file(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o600)
                .await?;
            first.write(b"shared", 0).await?;

            // A sibling process on the same machine gets the same handle.
            sim.on_process(b, TaskPriority::DefaultDelay).await?;
            let second = sim
                .open_file(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o600)
                .await?;
            assert!(Rc::ptr_eq(&first, &second));
            Ok(())
        })
        .expect("simulation");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn disk_model_charges_iops_and_bandwidth() {
    init_tracing();
    let dir = scratch_dir("timing");
    let path = dir.join("big").to_string_lossy().into_owned();

    Simulation::with_seed(4003)
        .run(|sim| async move {
            // Disk timing is only modeled while failure injection is on.
            sim.set_connection_failures_enabled(true);
            let p = one_process(&sim);
            sim.on_process(p, TaskPriority::DefaultDelay).await?;

            let file = sim
                .open_file(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o600)
                .await?;

            let before = sim.now();
            let megabyte = vec![7u8; 1_000_000];
            file.write(&megabyte, 0).await?;
            let elapsed = (sim.now() - before).as_secs_f64();

            // 1/iops + bytes/bandwidth with default 5k IOPS, 50 MB/s.
            assert!(elapsed >= 0.0002 + 0.02, "write too fast: {elapsed}");
            Ok(())
        })
        .expect("simulation");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn durable_delete_removes_the_file() {
    init_tracing();
    let dir = scratch_dir("delete");
    let path = dir.join("victim").to_string_lossy().into_owned();

    Simulation::with_seed(4004)
        .run(|sim| async move {
            sim.set_connection_failures_enabled(false);
            let p = one_process(&sim);
            sim.on_process(p, TaskPriority::DefaultDelay).await?;

            let file = sim
                .open_file(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o600)
                .await?;
            file.write(b"bytes", 0).await?;
            drop(file);

            sim.delete_file(&path, true).await?;

            let err = sim
                .open_file(&path, OpenFlags::READONLY, 0)
                .await
                .expect_err("durably deleted file must be gone");
            assert!(matches!(err, SimulationError::FileNotFound(_)));
            Ok(())
        })
        .expect("simulation");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn disk_space_drifts_within_bounds() {
    init_tracing();
    Simulation::with_seed(4005)
        .run(|sim| async move {
            let p = one_process(&sim);
            sim.on_process(p, TaskPriority::DefaultDelay).await?;

            let (free0, total) = sim.get_disk_bytes("/sim/data");
            assert!(total >= 5_000_000_000);
            assert!(free0 <= total);

            let mut prev = free0 as i64;
            for _ in 0..5 {
                let before = sim.now();
                sim.delay(Duration::from_secs(2), TaskPriority::DefaultDelay)
                    .await?;
                let dt = (sim.now() - before).as_secs_f64();

                let (free, total_again) = sim.get_disk_bytes("/sim/data");
                assert_eq!(total_again, total);
                assert!(free <= total);

                let bound = (dt.min(5.0) * 1e6) as i64 + 1;
                assert!(
                    (free as i64 - prev).abs() <= bound,
                    "drift {} exceeds bound {bound}",
                    free as i64 - prev
                );
                prev = free as i64;
            }
            Ok(())
        })
        .expect("simulation");
}
