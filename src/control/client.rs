//! Control protocol client

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::error::{ConnectError, ControlError};
use super::protocol::{ChannelKind, ControlMessage};

/// Client for the server's control endpoint
#[derive(Debug, Clone)]
pub struct ControlClient {
    url: String,
}

impl ControlClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the control connection
    pub async fn connect(&self) -> Result<ControlConnection, ConnectError> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| ConnectError::Unreachable {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        debug!("Connected to control endpoint: {}", self.url);

        Ok(ControlConnection {
            ws_stream,
            pending: VecDeque::new(),
        })
    }
}

/// An open control connection
pub struct ControlConnection {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Events that arrived while waiting for a reply
    pending: VecDeque<ControlMessage>,
}

impl ControlConnection {
    /// Send a message to the server
    pub async fn send(&mut self, msg: ControlMessage) -> Result<(), ControlError> {
        let json = serde_json::to_string(&msg)
            .map_err(|e| ControlError::InvalidMessage(format!("Serialize failed: {}", e)))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| ControlError::Transport(format!("Send failed: {}", e)))
    }

    /// Next message from the server, buffered events first
    pub async fn recv(&mut self) -> Result<ControlMessage, ControlError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        self.read().await
    }

    async fn read(&mut self) -> Result<ControlMessage, ControlError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!("control <- {}", text);
                    return serde_json::from_str(&text)
                        .map_err(|e| ControlError::InvalidMessage(format!("{}: {}", e, text)));
                }
                Some(Ok(Message::Close(_))) | None => return Err(ControlError::Closed),
                Some(Err(e)) => {
                    return Err(ControlError::Transport(format!("Receive failed: {}", e)));
                }
                _ => continue,
            }
        }
    }

    /// Ask for the port of `channel`, keeping any events that arrive first
    pub async fn query_port(&mut self, channel: ChannelKind) -> Result<u16, ControlError> {
        self.send(ControlMessage::request(channel)).await?;
        loop {
            let msg = self.read().await?;
            if let Some(port) = msg.reply_port(channel) {
                return Ok(port);
            }
            if let ControlMessage::Error { message } = msg {
                return Err(ControlError::Server(message));
            }
            self.pending.push_back(msg);
        }
    }

    pub async fn get_compose_port(&mut self) -> Result<u16, ControlError> {
        self.query_port(ChannelKind::Compose).await
    }

    pub async fn get_encode_port(&mut self) -> Result<u16, ControlError> {
        self.query_port(ChannelKind::Encode).await
    }

    pub async fn get_audio_port(&mut self) -> Result<u16, ControlError> {
        self.query_port(ChannelKind::Audio).await
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), ControlError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| ControlError::Transport(format!("Close failed: {}", e)))
    }
}
