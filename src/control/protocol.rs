//! Control protocol messages
//!
//! JSON text frames over a WebSocket. Requests are answered in order;
//! pushed events may arrive at any time, including between a request and
//! its reply.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of stream behind a preview port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Video,
    Audio,
}

/// Output channels whose port the server assigns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Compose,
    Encode,
    Audio,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Compose => "compose",
            ChannelKind::Encode => "encode",
            ChannelKind::Audio => "audio",
        };
        f.write_str(name)
    }
}

/// Events counted by a control session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ComposePortChanged,
    AudioPortChanged,
    PreviewPortAdded,
    ConnectionClosed,
}

/// Control protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    // Client -> Server
    GetComposePort,
    GetEncodePort,
    GetAudioPort,

    // Server -> Client replies
    ComposePort { port: u16 },
    EncodePort { port: u16 },
    AudioPort { port: u16 },

    // Server -> Client events
    SetComposePort { port: u16 },
    SetAudioPort { port: u16 },
    AddPreviewPort { port: u16, kind: PreviewKind },
    Error { message: String },
}

impl ControlMessage {
    /// Port carried by a reply to a `Get*Port` request for `channel`
    pub fn reply_port(&self, channel: ChannelKind) -> Option<u16> {
        match (self, channel) {
            (ControlMessage::ComposePort { port }, ChannelKind::Compose)
            | (ControlMessage::EncodePort { port }, ChannelKind::Encode)
            | (ControlMessage::AudioPort { port }, ChannelKind::Audio) => Some(*port),
            _ => None,
        }
    }

    /// Request for the port of `channel`
    pub fn request(channel: ChannelKind) -> Self {
        match channel {
            ChannelKind::Compose => ControlMessage::GetComposePort,
            ChannelKind::Encode => ControlMessage::GetEncodePort,
            ChannelKind::Audio => ControlMessage::GetAudioPort,
        }
    }
}
