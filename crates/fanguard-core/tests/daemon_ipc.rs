//! End-to-end tests: a daemon on the simulated driver, driven over its
//! Unix socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fanguard_config::policy::{Band, DeciCelsius};
use fanguard_config::{ControlPolicy, FanChannel, SensorId};
use fanguard_core::ipc::frame;
use fanguard_core::ipc::{ErrorKind, Request, RequestFrame, Response};
use fanguard_core::hardware::sim::SimulatedDriver;
use fanguard_core::{Daemon, IpcClient, IpcToken, LoopState};
use fanguard_test_utils::{TestConfigBuilder, TestDaemon, init_test_tracing};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

const MAX: usize = 64 * 1024;

fn c(deg: i32) -> DeciCelsius {
    DeciCelsius::from_celsius(deg)
}

/// CPU: 30 % base, 60 % above 50 °C (back below 45), 100 % above 70 °C
/// (back below 65). GPU fixed at 30 %.
fn scenario_policy() -> ControlPolicy {
    let mut policy = ControlPolicy::fixed(30);
    policy.sample_interval_ms = 250;
    policy.channels.cpu.bands = vec![Band::new(c(50), c(45), 60), Band::new(c(70), c(65), 100)];
    policy
}

fn running(snapshot: &fanguard_core::RuntimeSnapshot) -> bool {
    snapshot.state == LoopState::Running
}

fn applied(snapshot: &fanguard_core::RuntimeSnapshot, channel: FanChannel) -> Option<u8> {
    snapshot.channel(channel).and_then(|c| c.applied_duty)
}

// ── get_state ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_state_reports_safe_default_policy() {
    init_test_tracing();
    let td = TestDaemon::start().await;

    let snapshot = td.wait_for(|s| running(s) && applied(s, FanChannel::Gpu).is_some()).await;
    assert_eq!(snapshot.policy, ControlPolicy::fixed(100));
    assert_eq!(applied(&snapshot, FanChannel::Cpu), Some(100));
    assert_eq!(snapshot.health.driver, "simulated");
    assert_eq!(snapshot.version, fanguard_core::build_info::version_string());

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_persisted_policy_is_loaded_at_start() {
    init_test_tracing();
    let td = TestDaemon::spawn(TestConfigBuilder::new(), Some(scenario_policy()), |sim| {
        sim.set_all_temps(c(40));
    })
    .await;

    let snapshot = td.wait_for(|s| running(s) && applied(s, FanChannel::Cpu).is_some()).await;
    assert_eq!(snapshot.policy, scenario_policy());
    assert_eq!(applied(&snapshot, FanChannel::Cpu), Some(30));

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_policy_file_falls_back_to_safety() {
    init_test_tracing();
    let tmp = tempfile::TempDir::new().unwrap();
    let config = TestConfigBuilder::new().paths_in(tmp.path()).build();
    let token = IpcToken::generate();
    token
        .write(Path::new(&config.auth.token_path), false)
        .await
        .unwrap();
    tokio::fs::write(&config.daemon.policy_path, "channels = [[[")
        .await
        .unwrap();

    let client = IpcClient::new(&config.daemon.socket_path, token);
    let daemon = Arc::new(Daemon::new(config));
    let (driver, _sim) = SimulatedDriver::new();
    let runner = Arc::clone(&daemon);
    let task = tokio::spawn(async move { runner.run_with_driver(Box::new(driver)).await });

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(s) = client.get_state().await {
                if running(&s) {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(snapshot.policy, ControlPolicy::fixed(100));

    daemon.shutdown();
    task.await.unwrap().unwrap();
}

// ── set_policy ────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_policy_applies_and_persists() {
    init_test_tracing();
    let td = TestDaemon::spawn(TestConfigBuilder::new(), None, |sim| {
        sim.set_all_temps(c(40));
    })
    .await;
    td.wait_for(running).await;

    td.client().set_policy(scenario_policy()).await.unwrap();
    let snapshot = td.wait_for(|s| applied(s, FanChannel::Cpu) == Some(30)).await;
    assert_eq!(snapshot.policy, scenario_policy());

    td.sim.set_temp(SensorId::Cpu, c(72));
    td.wait_for(|s| applied(s, FanChannel::Cpu) == Some(100)).await;
    td.sim.set_temp(SensorId::Cpu, c(60));
    let snapshot = td.wait_for(|s| applied(s, FanChannel::Cpu) == Some(60)).await;
    assert_eq!(applied(&snapshot, FanChannel::Gpu), Some(30));

    let stored = tokio::fs::read_to_string(td.policy_path()).await.unwrap();
    assert_eq!(ControlPolicy::parse_toml(&stored).unwrap(), scenario_policy());

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_policy_is_rejected_and_previous_kept() {
    init_test_tracing();
    let td = TestDaemon::start().await;
    td.wait_for(running).await;
    let client = td.client();

    let mut inverted = scenario_policy();
    inverted.channels.cpu.bands[0] = Band::new(c(45), c(50), 60);
    let err = client.set_policy(inverted).await.unwrap_err();
    assert_eq!(err.daemon_kind(), Some(ErrorKind::MalformedPolicy));

    let mut hotter_is_slower = scenario_policy();
    hotter_is_slower.channels.cpu.bands[1].duty = 40;
    let err = client.set_policy(hotter_is_slower).await.unwrap_err();
    assert_eq!(err.daemon_kind(), Some(ErrorKind::UnsafeThreshold));

    let snapshot = client.get_state().await.unwrap();
    assert_eq!(snapshot.policy, ControlPolicy::fixed(100));
    assert!(!td.policy_path().exists());

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_policy_change_is_not_applied_later() {
    init_test_tracing();
    let td = TestDaemon::spawn(
        TestConfigBuilder::new().reply_timeout_ms(50),
        Some(scenario_policy()),
        |sim| sim.set_all_temps(c(40)),
    )
    .await;
    let settled = td.wait_for(running).await.generation;

    // Each tick now takes about 1.2 s. Send the request once the loop is
    // inside one.
    td.sim.set_latency(Duration::from_millis(300));
    let published = td.wait_for(|s| s.generation > settled).await.generation;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = td.client().set_policy(ControlPolicy::fixed(70)).await.unwrap_err();
    assert_eq!(err.daemon_kind(), Some(ErrorKind::Timeout));

    let later = td.wait_for(|s| s.generation >= published + 2).await;
    td.sim.set_latency(Duration::ZERO);
    assert_eq!(later.policy, scenario_policy());
    let stored = tokio::fs::read_to_string(td.policy_path()).await.unwrap();
    assert_eq!(ControlPolicy::parse_toml(&stored).unwrap(), scenario_policy());

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_applied_duty_respects_floor() {
    init_test_tracing();
    let td = TestDaemon::start_with(TestConfigBuilder::new().safety(25, 100, 100)).await;
    td.wait_for(running).await;

    let mut quiet = ControlPolicy::fixed(5);
    quiet.sample_interval_ms = 250;
    td.client().set_policy(quiet).await.unwrap();

    let snapshot = td
        .wait_for(|s| s.policy.channels.cpu.base_duty == 5 && applied(s, FanChannel::Cpu) == Some(25))
        .await;
    assert_eq!(snapshot.channel(FanChannel::Cpu).unwrap().target_duty, Some(5));
    assert_eq!(td.sim.duty(FanChannel::Gpu), Some(25));

    td.stop().await.unwrap();
}

// ── Authentication and framing ────────────────────────────────────

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    init_test_tracing();
    let td = TestDaemon::start().await;

    let intruder = IpcClient::new(td.socket_path(), IpcToken::generate());
    let err = intruder.get_state().await.unwrap_err();
    assert_eq!(err.daemon_kind(), Some(ErrorKind::Unauthorized));

    let err = intruder.set_policy(scenario_policy()).await.unwrap_err();
    assert_eq!(err.daemon_kind(), Some(ErrorKind::Unauthorized));
    assert!(!td.policy_path().exists());

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_garbage_frame_gets_malformed_and_close() {
    init_test_tracing();
    let td = TestDaemon::start().await;

    let mut stream = UnixStream::connect(td.socket_path()).await.unwrap();
    stream.write_all(&[0, 0, 0, 5]).await.unwrap();
    stream.write_all(b"hello").await.unwrap();

    let reply: Response = frame::recv(&mut stream, MAX, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        reply,
        Response::Error {
            error_kind: ErrorKind::Malformed,
            ..
        }
    ));
    let next = frame::recv::<_, Response>(&mut stream, MAX, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(next.is_none(), "connection should be closed");

    // The daemon keeps serving other clients.
    td.client().get_state().await.unwrap();
    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_is_malformed() {
    init_test_tracing();
    let td = TestDaemon::start_with(TestConfigBuilder::new().max_frame_bytes(1024)).await;

    let mut stream = UnixStream::connect(td.socket_path()).await.unwrap();
    stream.write_all(&4096u32.to_be_bytes()).await.unwrap();

    let reply: Response = frame::recv(&mut stream, MAX, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        reply,
        Response::Error {
            error_kind: ErrorKind::Malformed,
            ..
        }
    ));
    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_stalled_frame_times_out() {
    init_test_tracing();
    let td = TestDaemon::start_with(TestConfigBuilder::new().request_timeout_ms(100)).await;

    let mut stream = UnixStream::connect(td.socket_path()).await.unwrap();
    stream.write_all(&[0, 0, 0, 40, b'{']).await.unwrap();

    let reply: Response = frame::recv(&mut stream, MAX, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        reply,
        Response::Error {
            error_kind: ErrorKind::Timeout,
            ..
        }
    ));
    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_serves_several_requests() {
    init_test_tracing();
    let td = TestDaemon::start().await;
    td.wait_for(running).await;

    let mut stream = UnixStream::connect(td.socket_path()).await.unwrap();
    for _ in 0..3 {
        let request = RequestFrame::new(td.token.expose(), Request::GetState);
        frame::write_frame(&mut stream, &request, MAX).await.unwrap();
        let reply: Response = frame::recv(&mut stream, MAX, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Response::StateSnapshot { .. }));
    }
    td.stop().await.unwrap();
}

// ── subscribe ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_streams_increasing_generations() {
    init_test_tracing();
    let td = TestDaemon::spawn(TestConfigBuilder::new(), Some(scenario_policy()), |_| {}).await;
    td.wait_for(running).await;

    let mut updates = td.client().subscribe().await.unwrap();
    let first = updates.next().await.unwrap().unwrap();
    let second = updates.next().await.unwrap().unwrap();
    let third = updates.next().await.unwrap().unwrap();
    assert!(second.generation > first.generation);
    assert!(third.generation > second.generation);

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_subscription_sees_policy_change() {
    init_test_tracing();
    let td = TestDaemon::spawn(TestConfigBuilder::new(), None, |sim| sim.set_all_temps(c(40))).await;
    td.wait_for(running).await;

    let mut updates = td.client().subscribe().await.unwrap();
    td.client().set_policy(scenario_policy()).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(snapshot) = updates.next().await {
            let snapshot = snapshot.unwrap();
            if snapshot.policy == scenario_policy() {
                return snapshot;
            }
        }
        panic!("subscription ended before the policy change");
    })
    .await
    .unwrap();
    assert_eq!(seen.policy.channels.cpu.bands.len(), 2);

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_ends_subscription() {
    init_test_tracing();
    let td = TestDaemon::spawn(TestConfigBuilder::new(), Some(scenario_policy()), |_| {}).await;
    td.wait_for(running).await;

    let mut updates = td.client().subscribe().await.unwrap();
    updates.next().await.unwrap().unwrap();
    td.stop().await.unwrap();

    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = updates.next().await {
            if item.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(rest.is_ok(), "subscription should end after shutdown");
}

// ── Failure handling and shutdown ─────────────────────────────────

#[tokio::test]
async fn test_failing_sensor_degrades_then_recovers() {
    init_test_tracing();
    let td = TestDaemon::spawn(
        TestConfigBuilder::new().degraded_threshold(2).staleness_ticks(1),
        Some(scenario_policy()),
        |sim| sim.set_all_temps(c(40)),
    )
    .await;
    td.wait_for(|s| running(s) && applied(s, FanChannel::Cpu) == Some(30)).await;

    td.sim.fail_reads(10);
    let degraded = td.wait_for(|s| s.state == LoopState::Degraded).await;
    assert_eq!(applied(&degraded, FanChannel::Cpu), Some(100));
    assert_eq!(applied(&degraded, FanChannel::Gpu), Some(100));
    assert!(degraded.health.last_error.is_some());

    let recovered = td.wait_for(|s| running(s) && applied(s, FanChannel::Cpu) == Some(30)).await;
    assert_eq!(recovered.health.consecutive_failures, 0);

    td.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_leaves_fans_at_safety_duty() {
    init_test_tracing();
    let td = TestDaemon::spawn(
        TestConfigBuilder::new().safety(20, 95, 95),
        Some(scenario_policy()),
        |sim| sim.set_all_temps(c(40)),
    )
    .await;
    td.wait_for(|s| applied(s, FanChannel::Gpu) == Some(30)).await;

    let sim = td.sim.clone();
    let socket = td.socket_path();
    td.stop().await.unwrap();

    let log = sim.duty_log();
    let last_cpu = log.iter().rev().find(|(ch, _)| *ch == FanChannel::Cpu);
    let last_gpu = log.iter().rev().find(|(ch, _)| *ch == FanChannel::Gpu);
    assert_eq!(last_cpu, Some(&(FanChannel::Cpu, 95)));
    assert_eq!(last_gpu, Some(&(FanChannel::Gpu, 95)));
    assert_eq!(sim.shutdown_calls(), 1);
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_second_daemon_cannot_take_live_socket() {
    init_test_tracing();
    let td = TestDaemon::start().await;
    let err = fanguard_core::ipc::server::bind(&td.socket_path()).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    td.client().get_state().await.unwrap();
    td.stop().await.unwrap();
}
