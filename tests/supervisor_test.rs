//! Subprocess supervisor tests against the mock switch server
//!
//! Launches the real binary, terminates it and relaunches it on the same
//! ports, which only works if termination waits for the ports to be free.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use tempfile::TempDir;

use switch_harness::control::ControlClient;
use switch_harness::process::Supervisor;

/// Find an available port for testing
fn find_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Whether a listener could be bound on `port` right now
fn port_free(port: u16) -> bool {
    StdTcpListener::bind(("127.0.0.1", port)).is_ok()
}

struct ServerPorts {
    control: u16,
    video: u16,
    audio: u16,
    compose: u16,
    encode: u16,
    preview_base: u16,
}

impl ServerPorts {
    fn allocate() -> Self {
        Self {
            control: find_available_port(),
            video: find_available_port(),
            audio: find_available_port(),
            compose: find_available_port(),
            encode: find_available_port(),
            preview_base: find_available_port(),
        }
    }

    fn argv(&self, record: &std::path::Path) -> Vec<String> {
        vec![
            env!("CARGO_BIN_EXE_mock-switch-server").to_string(),
            "-v".to_string(),
            format!("--record={}", record.display()),
            format!("--control-port={}", self.control),
            format!("--video-port={}", self.video),
            format!("--audio-port={}", self.audio),
            format!("--compose-port={}", self.compose),
            format!("--encode-port={}", self.encode),
            format!("--preview-base={}", self.preview_base),
        ]
    }
}

/// Test: Output is captured to a per-process log file
/// Given the mock server launched by the supervisor
/// When it is terminated
/// Then it exits cleanly and its log file holds its output
#[tokio::test]
async fn test_launch_and_terminate_logs_output() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let ports = ServerPorts::allocate();
    let supervisor = Supervisor::new(dir.path())
        .with_prefix("server")
        .with_grace(Duration::from_millis(100));

    let process = supervisor
        .launch(ports.argv(&dir.path().join("record.data")))
        .await
        .expect("Failed to launch server");
    let log_path = process.log_path().to_path_buf();
    assert!(log_path.starts_with(dir.path()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!process.has_exited(), "Server exited during startup");

    let report = supervisor.terminate(process).await.expect("Terminate failed");
    assert_eq!(report.code, Some(0));
    assert!(report.bytes_logged > 0);

    let log = std::fs::read_to_string(&log_path).expect("Failed to read log");
    assert!(log.contains("SIGTERM received"));
    assert!(dir.path().join("record.data").exists());
}

/// Test: Relaunch on the same ports
/// Given a server that was terminated through the supervisor
/// When a new server is launched on the same ports right away
/// Then the ports are held until terminate returns, free afterwards, and
/// the new server stays up and answers on its control port
#[tokio::test]
async fn test_relaunch_reuses_ports() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let ports = ServerPorts::allocate();
    let record = dir.path().join("record.data");
    let supervisor = Supervisor::new(dir.path()).with_grace(Duration::from_millis(200));

    let first = supervisor.launch(ports.argv(&record)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!first.has_exited(), "Server exited during startup");
    assert!(!port_free(ports.control), "Control port not held by the server");
    assert!(!port_free(ports.video), "Video port not held by the server");

    supervisor.terminate(first).await.expect("Terminate failed");
    assert!(port_free(ports.control), "Control port still held after terminate");
    assert!(port_free(ports.video), "Video port still held after terminate");

    let second = supervisor.launch(ports.argv(&record)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!second.has_exited(), "Relaunched server could not bind its ports");

    let client = ControlClient::new(&format!("ws://127.0.0.1:{}", ports.control));
    let mut connection = client.connect().await.expect("Control port not answering");
    assert_eq!(connection.get_compose_port().await.unwrap(), ports.compose);
    assert_eq!(connection.get_encode_port().await.unwrap(), ports.encode);
    assert_eq!(connection.get_audio_port().await.unwrap(), 0);
    connection.close().await.ok();

    supervisor.terminate(second).await.expect("Terminate failed");
}

/// Test: A program that cannot start
/// Given an argv naming a missing program
/// When it is launched
/// Then launch fails and no log file is left behind
#[tokio::test]
async fn test_missing_program_fails_launch() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let supervisor = Supervisor::new(dir.path());

    let result = supervisor
        .launch(vec!["/nonexistent/switch-server".to_string()])
        .await;
    assert!(result.is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// Test: A process that ignores SIGTERM
/// Given a process started with SIGTERM ignored
/// When it is terminated with a short exit timeout
/// Then it is killed and reported as killed by a signal
#[tokio::test]
async fn test_sigterm_ignored_escalates_to_kill() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let supervisor = Supervisor::new(dir.path())
        .with_grace(Duration::ZERO)
        .with_exit_timeout(Duration::from_millis(500));

    let process = supervisor
        .launch(vec![
            "sh".to_string(),
            "-c".to_string(),
            "trap '' TERM; echo ready; exec sleep 30".to_string(),
        ])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = supervisor.terminate(process).await.expect("Terminate failed");
    assert_eq!(report.code, None);
    assert_eq!(report.signal, Some(9));
}
