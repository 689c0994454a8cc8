//! Stand-in switch server
//!
//! Accepts video and audio sources, hands out a preview port per source,
//! serves the composite and encoded outputs, records everything it receives
//! and speaks the control protocol. Exits cleanly on SIGTERM or Ctrl-C.
//!
//! Run with:
//!   cargo run --bin mock-switch-server -- --record=test-recording.data

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Level};

use switch_harness::control::{ControlMessage, PreviewKind};

/// Read size for incoming media
const READ_SIZE: usize = 188 * 7;

/// Buffered chunks per output before slow readers start skipping
const OUTPUT_BACKLOG: usize = 256;

/// Time given to connection tasks to say goodbye on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(200);

/// Stand-in media switching server for the integration harness
#[derive(Parser, Debug)]
#[command(name = "mock-switch-server")]
#[command(about = "Stand-in media switching server for the integration harness")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Accepted for command-line compatibility
    #[arg(long)]
    gst_debug_no_color: bool,

    /// File receiving everything the sources send
    #[arg(long, default_value = "test-recording.data")]
    record: PathBuf,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Control protocol (WebSocket) port
    #[arg(long, default_value = "5000")]
    control_port: u16,

    /// Port accepting video sources
    #[arg(long, default_value = "3000")]
    video_port: u16,

    /// Port accepting audio sources
    #[arg(long, default_value = "4000")]
    audio_port: u16,

    /// Composite output port
    #[arg(long, default_value = "3001")]
    compose_port: u16,

    /// Encoded output port
    #[arg(long, default_value = "3002")]
    encode_port: u16,

    /// First preview port
    #[arg(long, default_value = "3003")]
    preview_base: u16,
}

#[derive(Default)]
struct Assignments {
    next_preview: u16,
    compose_announced: bool,
    audio_port: Option<u16>,
}

/// State shared by every connection
struct Switch {
    host: String,
    compose_port: u16,
    encode_port: u16,
    assignments: Mutex<Assignments>,
    events: broadcast::Sender<ControlMessage>,
    output: broadcast::Sender<Vec<u8>>,
    recorder: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
}

impl Switch {
    fn announce(&self, msg: ControlMessage) {
        debug!("event: {:?}", msg);
        // No subscribers just means no control client is connected
        let _ = self.events.send(msg);
    }

    /// Assign the next preview port to a new source and tell the clients
    fn attach(&self, kind: PreviewKind) -> u16 {
        let mut events = Vec::new();
        let port = {
            let mut assignments = self.assignments.lock();
            let port = assignments.next_preview;
            assignments.next_preview = port.saturating_add(1);

            if kind == PreviewKind::Video && !assignments.compose_announced {
                assignments.compose_announced = true;
                events.push(ControlMessage::SetComposePort {
                    port: self.compose_port,
                });
            }
            events.push(ControlMessage::AddPreviewPort { port, kind });
            if kind == PreviewKind::Audio && assignments.audio_port.is_none() {
                assignments.audio_port = Some(port);
                events.push(ControlMessage::SetAudioPort { port });
            }
            port
        };
        for event in events {
            self.announce(event);
        }
        port
    }

    fn reply(&self, msg: ControlMessage) -> ControlMessage {
        match msg {
            ControlMessage::GetComposePort => ControlMessage::ComposePort {
                port: self.compose_port,
            },
            ControlMessage::GetEncodePort => ControlMessage::EncodePort {
                port: self.encode_port,
            },
            ControlMessage::GetAudioPort => ControlMessage::AudioPort {
                port: self.assignments.lock().audio_port.unwrap_or(0),
            },
            other => ControlMessage::Error {
                message: format!("Unsupported request: {:?}", other),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let bind = |port: u16| format!("{}:{}", args.host, port);
    let control = TcpListener::bind(bind(args.control_port)).await?;
    let video = TcpListener::bind(bind(args.video_port)).await?;
    let audio = TcpListener::bind(bind(args.audio_port)).await?;
    let compose = TcpListener::bind(bind(args.compose_port)).await?;
    let encode = TcpListener::bind(bind(args.encode_port)).await?;

    let record = File::create(&args.record).await?;
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let recorder = tokio::spawn(record_sources(record, record_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(64);
    let (output, _) = broadcast::channel(OUTPUT_BACKLOG);

    let switch = Arc::new(Switch {
        host: args.host.clone(),
        compose_port: args.compose_port,
        encode_port: args.encode_port,
        assignments: Mutex::new(Assignments {
            next_preview: args.preview_base,
            ..Assignments::default()
        }),
        events,
        output,
        recorder: record_tx,
        shutdown: shutdown_rx,
    });

    info!(
        "Switch server on {}: control {}, video {}, audio {}, compose {}, encode {}",
        args.host,
        args.control_port,
        args.video_port,
        args.audio_port,
        args.compose_port,
        args.encode_port
    );
    info!("Recording to {}", args.record.display());

    tokio::spawn(accept_control(control, switch.clone()));
    tokio::spawn(accept_sources(video, PreviewKind::Video, switch.clone()));
    tokio::spawn(accept_sources(audio, PreviewKind::Audio, switch.clone()));
    tokio::spawn(serve_output(compose, switch.clone()));
    tokio::spawn(serve_output(encode, switch.clone()));

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    shutdown_tx.send_replace(true);
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    // The recorder finishes once every sender is gone
    drop(switch);
    match tokio::time::timeout(SHUTDOWN_DRAIN, recorder).await {
        Ok(Ok(Ok(bytes))) => info!("Recorded {} bytes", bytes),
        Ok(Ok(Err(e))) => error!("Recording failed: {}", e),
        Ok(Err(e)) => error!("Recorder task failed: {}", e),
        Err(_) => warn!("Recorder still busy at exit"),
    }

    Ok(())
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn record_sources(
    mut file: File,
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = chunks.recv().await {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn accept_control(listener: TcpListener, switch: Arc<Switch>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_control(stream, peer, switch.clone()));
                }
                Err(e) => error!("Control accept error: {}", e),
            },
            _ = shutdown_signal(switch.shutdown.clone()) => return,
        }
    }
}

async fn handle_control(stream: TcpStream, peer: SocketAddr, switch: Arc<Switch>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket upgrade failed for {}: {}", peer, e);
            return;
        }
    };
    info!("Control client connected: {}", peer);

    let (mut write, mut read) = ws_stream.split();
    let mut events = switch.events.subscribe();
    let shutdown = shutdown_signal(switch.shutdown.clone());
    tokio::pin!(shutdown);

    loop {
        let outgoing = tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(request) => switch.reply(request),
                    Err(e) => ControlMessage::Error {
                        message: format!("Invalid message: {}", e),
                    },
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Control connection error for {}: {}", peer, e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Control client {} missed {} events", peer, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        };

        let json = match serde_json::to_string(&outgoing) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode {:?}: {}", outgoing, e);
                continue;
            }
        };
        if write.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    info!("Control client disconnected: {}", peer);
}

async fn accept_sources(listener: TcpListener, kind: PreviewKind, switch: Arc<Switch>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_source(stream, peer, kind, switch.clone()));
                }
                Err(e) => error!("Source accept error: {}", e),
            },
            _ = shutdown_signal(switch.shutdown.clone()) => return,
        }
    }
}

async fn handle_source(mut stream: TcpStream, peer: SocketAddr, kind: PreviewKind, switch: Arc<Switch>) {
    let port = switch.attach(kind);
    info!("{:?} source {} attached, preview on {}", kind, peer, port);

    let (preview, _) = broadcast::channel::<Vec<u8>>(OUTPUT_BACKLOG);
    let (detached_tx, detached_rx) = watch::channel(false);
    match TcpListener::bind(format!("{}:{}", switch.host, port)).await {
        Ok(listener) => {
            tokio::spawn(serve_preview(listener, preview.clone(), detached_rx));
        }
        Err(e) => warn!("Cannot open preview port {}: {}", port, e),
    }

    let shutdown = shutdown_signal(switch.shutdown.clone());
    tokio::pin!(shutdown);
    let mut buf = vec![0u8; READ_SIZE];
    loop {
        let n = tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Source {} read error: {}", peer, e);
                    break;
                }
            },
            _ = &mut shutdown => break,
        };
        let chunk = buf[..n].to_vec();
        let _ = preview.send(chunk.clone());
        let _ = switch.output.send(chunk.clone());
        let _ = switch.recorder.send(chunk);
    }

    detached_tx.send_replace(true);
    info!("{:?} source {} detached", kind, peer);
}

/// Serve one source's stream until the source goes away
async fn serve_preview(
    listener: TcpListener,
    preview: broadcast::Sender<Vec<u8>>,
    detached: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Preview client {} connected", peer);
                    tokio::spawn(push(stream, preview.subscribe(), detached.clone()));
                }
                Err(e) => error!("Preview accept error: {}", e),
            },
            _ = shutdown_signal(detached.clone()) => return,
        }
    }
}

async fn serve_output(listener: TcpListener, switch: Arc<Switch>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Output client {} connected", peer);
                    tokio::spawn(push(stream, switch.output.subscribe(), switch.shutdown.clone()));
                }
                Err(e) => error!("Output accept error: {}", e),
            },
            _ = shutdown_signal(switch.shutdown.clone()) => return,
        }
    }
}

/// Copy chunks to a client until `stop` is raised; the client then sees
/// end of stream
async fn push(mut stream: TcpStream, mut chunks: broadcast::Receiver<Vec<u8>>, stop: watch::Receiver<bool>) {
    let stop = shutdown_signal(stop);
    tokio::pin!(stop);
    loop {
        let chunk = tokio::select! {
            chunk = chunks.recv() => match chunk {
                Ok(chunk) => chunk,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        };
        if stream.write_all(&chunk).await.is_err() {
            return;
        }
    }
    let _ = stream.shutdown().await;
}
