//! E2E tests for the control-client harness
//!
//! Runs an in-process control server and checks what a session records:
//! initial ports, pushed events in order, and closure.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use switch_harness::control::{
    ChannelKind, ConnectError, ControlClient, ControlHarness, ControlMessage, ControlSession,
    ControlTask, EventKind, ExpectedPorts, LiveClients, PreviewKind, SessionState,
};

/// Find an available port for testing
fn find_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Start a control server that pushes `early` before answering the first
/// request, answers port queries, then pushes `late` and closes
async fn start_control_server(
    port: u16,
    early: Vec<ControlMessage>,
    late: Vec<ControlMessage>,
) -> tokio::task::JoinHandle<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind control server");

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("WebSocket upgrade failed");

        let send = |msg: &ControlMessage| Message::Text(serde_json::to_string(msg).unwrap());
        let mut answered = 0;
        let mut early = Some(early);
        while answered < 3 {
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                return;
            };
            if let Some(events) = early.take() {
                for event in &events {
                    ws.send(send(event)).await.unwrap();
                }
            }
            let reply = match serde_json::from_str::<ControlMessage>(&text).unwrap() {
                ControlMessage::GetComposePort => ControlMessage::ComposePort { port: 3001 },
                ControlMessage::GetEncodePort => ControlMessage::EncodePort { port: 3002 },
                ControlMessage::GetAudioPort => ControlMessage::AudioPort { port: 0 },
                other => ControlMessage::Error {
                    message: format!("unexpected {:?}", other),
                },
            };
            ws.send(send(&reply)).await.unwrap();
            answered += 1;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        for event in &late {
            ws.send(send(event)).await.unwrap();
        }
        let _ = ws.close(None).await;
    })
}

fn expected() -> ExpectedPorts {
    ExpectedPorts {
        compose: 3001,
        encode: 3002,
    }
}

/// Test: Initial ports are queried on connect
/// Given a control server assigning compose 3001 and encode 3002
/// When the harness connects
/// Then the initial ports are recorded and match the expected values
#[tokio::test]
async fn test_connect_queries_initial_ports() {
    let port = find_available_port();
    let server = start_control_server(port, Vec::new(), Vec::new()).await;

    let client = ControlClient::new(&format!("ws://127.0.0.1:{}", port));
    let mut harness = ControlHarness::new(client, ControlSession::new()).expect_ports(expected());
    harness.connect().await.expect("Failed to connect");

    let initial = harness.initial_ports().unwrap();
    assert_eq!(initial.compose, 3001);
    assert_eq!(initial.encode, 3002);
    assert_eq!(initial.audio, 0);

    harness.run().await.unwrap();
    assert_eq!(harness.events().count(EventKind::ConnectionClosed), 1);
    server.await.unwrap();
}

/// Test: Events pushed during a query are kept
/// Given a server that pushes a compose port change before its first reply
/// When the harness connects and runs
/// Then the early event is still dispatched
#[tokio::test]
async fn test_events_during_query_are_buffered() {
    let port = find_available_port();
    let server = start_control_server(
        port,
        vec![ControlMessage::SetComposePort { port: 3001 }],
        Vec::new(),
    )
    .await;

    let client = ControlClient::new(&format!("ws://127.0.0.1:{}", port));
    let mut harness = ControlHarness::new(client, ControlSession::new());
    harness.connect().await.unwrap();
    harness.run().await.unwrap();

    let session = harness.into_events();
    assert_eq!(session.count(EventKind::ComposePortChanged), 1);
    assert_eq!(session.port(ChannelKind::Compose), Some(3001));
    server.await.unwrap();
}

/// Test: Preview slots follow arrival order
/// Given a server announcing previews 3003 then 3004 and an audio port
/// When the session ends
/// Then slot 1 is 3003, slot 2 is 3004 and each event kind is counted
#[tokio::test]
async fn test_session_records_events_in_order() {
    let port = find_available_port();
    let server = start_control_server(
        port,
        Vec::new(),
        vec![
            ControlMessage::SetComposePort { port: 3001 },
            ControlMessage::AddPreviewPort {
                port: 3003,
                kind: PreviewKind::Video,
            },
            ControlMessage::AddPreviewPort {
                port: 3004,
                kind: PreviewKind::Audio,
            },
            ControlMessage::SetAudioPort { port: 3004 },
        ],
    )
    .await;

    let live = LiveClients::new();
    let task = ControlTask::spawn(&format!("ws://127.0.0.1:{}", port), Some(expected()), &live);
    assert_eq!(live.count(), 1);

    let session = task.join().await.expect("Session failed");
    assert_eq!(live.count(), 0);
    assert_eq!(session.state, SessionState::Closed);
    assert_eq!(session.preview_slot(1), Some(3003));
    assert_eq!(session.preview_slot(2), Some(3004));
    assert_eq!(session.count(EventKind::PreviewPortAdded), 2);
    assert_eq!(session.count(EventKind::ComposePortChanged), 1);
    assert_eq!(session.count(EventKind::AudioPortChanged), 1);
    assert_eq!(session.port(ChannelKind::Audio), Some(3004));
    server.await.unwrap();
}

/// Test: A wrong initial port fails the session
/// Given a server reporting compose 3001
/// When the harness expects compose 4001
/// Then connect fails with UnexpectedPort
#[tokio::test]
async fn test_unexpected_initial_port() {
    let port = find_available_port();
    let _server = start_control_server(port, Vec::new(), Vec::new()).await;

    let client = ControlClient::new(&format!("ws://127.0.0.1:{}", port));
    let mut harness = ControlHarness::new(client, ControlSession::new()).expect_ports(
        ExpectedPorts {
            compose: 4001,
            encode: 3002,
        },
    );

    let result = harness.connect().await;
    assert_eq!(
        result,
        Err(ConnectError::UnexpectedPort {
            channel: ChannelKind::Compose,
            expected: 4001,
            actual: 3001,
        })
    );
}

/// Test: Nothing listening
/// Given no control server
/// When a session task starts
/// Then it ends with Unreachable and the live count drops back to zero
#[tokio::test]
async fn test_unreachable_server() {
    let port = find_available_port();
    let live = LiveClients::new();
    let mut task = ControlTask::spawn(&format!("ws://127.0.0.1:{}", port), None, &live);

    assert!(!task.wait_connected().await);
    let result = task.join().await;
    assert!(matches!(result, Err(ConnectError::Unreachable { .. })));
    assert_eq!(live.count(), 0);
}
