//! Launcher behaviour with shell stand-ins for the GUI server and handler.
//!
//! The "server" is a sleeping shell; readiness is answered by a mock HTTP
//! server listening on the configured port.
#![cfg(unix)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use worker_core::{HumanDuration, WorkerConfig};
use worker_launch::{LaunchError, Launcher};

fn sh(script: &str) -> (String, Vec<String>) {
    // Trailing listen/port flags become positional parameters of the script.
    (
        "sh".to_string(),
        vec!["-c".to_string(), script.to_string(), "sh".to_string()],
    )
}

fn config(addr: SocketAddr, server_script: &str, handler_script: &str) -> WorkerConfig {
    let mut config = WorkerConfig::default();

    let (program, args) = sh(server_script);
    config.server.program = program;
    config.server.args = args;
    config.server.working_dir = None;
    config.server.listen = addr.ip().to_string();
    config.server.port = addr.port();

    let (program, args) = sh(handler_script);
    config.handler.program = Some(program);
    config.handler.args = args;

    config.readiness.interval = HumanDuration::from_millis(20);
    config.readiness.max_interval = HumanDuration::from_millis(100);
    config.readiness.probe_timeout = HumanDuration::from_millis(200);
    config.readiness.max_wait = HumanDuration::from_secs(5);
    config.shutdown.grace_period = HumanDuration::from_secs(2);
    config
}

async fn ready_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"system\":{}}"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn handler_exit_code_is_propagated() {
    let gui = ready_server().await;
    let launcher = Launcher::new(config(*gui.address(), "sleep 30", "exit 7"));

    let started = Instant::now();
    let code = launcher.run().await.unwrap();

    assert_eq!(code, 7);
    // The sleeping server was terminated, not waited out.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn handler_sees_server_url() {
    let gui = ready_server().await;
    let script = "case \"$COMFY_URL\" in http://127.0.0.1:*) exit 0;; *) exit 9;; esac";
    let launcher = Launcher::new(config(*gui.address(), "sleep 30", script));

    assert_eq!(launcher.run().await.unwrap(), 0);
}

#[tokio::test]
async fn handler_starts_only_after_readiness() {
    let gui = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&gui)
        .await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&gui)
        .await;

    let launcher = Launcher::new(config(*gui.address(), "sleep 30", "exit 0"));
    assert_eq!(launcher.run().await.unwrap(), 0);

    let probes = gui.received_requests().await.unwrap();
    assert_eq!(probes.len(), 4);
}

#[tokio::test]
async fn server_crash_before_ready_fails_fast() {
    let closed: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("handler-ran");

    let mut cfg = config(
        closed,
        "exit 3",
        &format!("touch {}", marker.display()),
    );
    cfg.readiness.max_wait = HumanDuration::from_secs(30);

    let started = Instant::now();
    let err = Launcher::new(cfg).run().await.unwrap_err();

    assert!(matches!(err, LaunchError::ServerExited { code: 3 }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!marker.exists());
}

#[tokio::test]
async fn readiness_timeout_fails_without_starting_handler() {
    let closed: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("handler-ran");

    let mut cfg = config(
        closed,
        "sleep 30",
        &format!("touch {}", marker.display()),
    );
    cfg.readiness.max_wait = HumanDuration::from_millis(300);

    let err = Launcher::new(cfg).run().await.unwrap_err();

    assert!(matches!(err, LaunchError::NotReady(_)), "{err}");
    assert!(!marker.exists());
}

#[tokio::test]
async fn missing_server_binary_is_a_spawn_error() {
    let gui = ready_server().await;
    let mut cfg = config(*gui.address(), "sleep 30", "exit 0");
    cfg.server.program = "/nonexistent/python".to_string();

    let err = Launcher::new(cfg).run().await.unwrap_err();
    assert!(matches!(err, LaunchError::Spawn { role: "server", .. }), "{err}");
}

#[tokio::test]
async fn server_death_does_not_stop_the_handler() {
    let gui = ready_server().await;
    let launcher = Launcher::new(config(
        *gui.address(),
        "sleep 0.3; exit 4",
        "sleep 1.5; exit 6",
    ));

    let started = Instant::now();
    let code = launcher.run().await.unwrap();

    assert_eq!(code, 6);
    // The handler ran to completion after the server was gone.
    assert!(started.elapsed() >= Duration::from_millis(1400));
}
