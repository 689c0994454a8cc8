//! Test case runner tests with the simulated engine
//!
//! Sources push into a local TCP listener, sinks read from one, so cases
//! see real connection refusals and end-of-stream.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::Instant;

use switch_harness::pipeline::{PipelineEngine, PipelineState, SimulatedEngine};
use switch_harness::runner::{run_all, TestCase};

/// Find an available port for testing
fn find_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

fn engine() -> Arc<dyn PipelineEngine> {
    Arc::new(SimulatedEngine::new().latency(Duration::from_millis(5)))
}

fn source(port: u16) -> String {
    format!("videotestsrc ! tcpclientsink port={}", port)
}

fn sink(port: u16) -> String {
    format!("tcpclientsrc port={} ! fakesink", port)
}

/// Accept connections and read until each peer closes
async fn start_drain(port: u16) {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind listener");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
}

/// Test: A source runs for its lifetime
/// Given a listener accepting the source's stream
/// When a source case with a one second lifetime runs
/// Then it ends in Done with no errors after about one second
#[tokio::test]
async fn test_source_runs_for_lifetime() {
    let port = find_available_port();
    start_drain(port).await;

    let case = TestCase::new("test-video-source1", source(port), 1);
    let started = Instant::now();
    case.run(engine()).expect("Failed to start case");

    let outcome = case.join().await.expect("No outcome");
    let elapsed = started.elapsed();
    assert_eq!(outcome.state, PipelineState::Done);
    assert_eq!(outcome.error_count, 0);
    assert!(outcome.passed());
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
}

/// Test: Concurrent joins
/// Given a running case
/// When three tasks join it at the same time
/// Then every join returns the same outcome
#[tokio::test]
async fn test_concurrent_joins_agree() {
    let port = find_available_port();
    start_drain(port).await;

    let case = TestCase::new("test-audio-source1", source(port), 1);
    case.run(engine()).unwrap();

    let joins: Vec<_> = (0..3)
        .map(|_| {
            let case = case.clone();
            tokio::spawn(async move { case.join().await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for join in joins {
        outcomes.push(join.await.unwrap().expect("No outcome"));
    }
    assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(!case.is_running());
}

/// Test: Refused connection
/// Given nothing listening on the source's port
/// When a source case without a lifetime runs
/// Then it stops after the first element error and counts it
#[tokio::test]
async fn test_refused_connection_counts_error() {
    let port = find_available_port();

    let case = TestCase::new("test-video-source1", source(port), 0);
    let started = Instant::now();
    case.run(engine()).unwrap();

    let outcome = case.join().await.unwrap();
    assert!(outcome.error_count >= 1);
    assert!(!outcome.passed());
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Test: A sink reaches end of stream
/// Given a server that sends a little data and closes
/// When a sink case without a lifetime reads from it
/// Then the sink ends in Done with no errors
#[tokio::test]
async fn test_sink_finishes_on_end_of_stream() {
    use tokio::io::AsyncWriteExt;

    let port = find_available_port();
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(&[0u8; 1316]).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let case = TestCase::new("test_video_preview_sink1", sink(port), 0);
    case.run(engine()).unwrap();

    let outcome = case.join().await.unwrap();
    assert_eq!(outcome.state, PipelineState::Done);
    assert_eq!(outcome.error_count, 0);
}

/// Test: Running a batch
/// Given one valid source and one malformed description
/// When both are run together
/// Then the valid one passes and the malformed one reports a launch error
#[tokio::test]
async fn test_run_all_reports_each_case() {
    let port = find_available_port();
    start_drain(port).await;

    let cases = vec![
        TestCase::new("good", source(port), 1),
        TestCase::new("bad", "videotestsrc ! ! fakesink", 1),
    ];
    let outcomes = run_all(&cases, &engine()).await;

    let good = outcomes[0].as_ref().expect("good did not start");
    let bad = outcomes[1].as_ref().expect("bad did not start");
    assert!(good.passed());
    assert!(bad.launch_error.is_some());
    assert_eq!(bad.state, PipelineState::Idle);
}
