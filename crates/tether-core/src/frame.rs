//! Inbound frames and outbound envelopes.
//!
//! Both are `type`-tagged JSON objects on the wire. Inbound frames also
//! accept the ASGI-style `websocket.` prefix (`websocket.connect`, ...).

use serde::{Deserialize, Serialize};

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the transport vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// One inbound protocol event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFrame", into = "RawFrame")]
pub enum Frame {
    /// The peer asked to open the connection.
    Connect,
    /// The peer went away.
    Disconnect {
        /// Close code, when one was sent.
        code: Option<u16>,
    },
    /// A data message.
    Receive {
        /// Text payload, expected to hold JSON.
        text: Option<String>,
    },
    /// A frame whose `type` the loop does not recognise.
    Unknown {
        /// The raw `type` field.
        kind: String,
    },
}

impl Frame {
    /// A `receive` frame carrying `text`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Receive {
            text: Some(text.into()),
        }
    }

    /// A `disconnect` frame with no close code.
    pub fn disconnect() -> Self {
        Self::Disconnect { code: None }
    }

    /// The frame's `type` discriminant.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Receive { .. } => "receive",
            Self::Unknown { kind } => kind,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl From<RawFrame> for Frame {
    fn from(raw: RawFrame) -> Self {
        let kind = raw.kind.strip_prefix("websocket.").unwrap_or(&raw.kind);
        match kind {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect { code: raw.code },
            "receive" => Self::Receive { text: raw.text },
            _ => Self::Unknown {
                kind: raw.kind.clone(),
            },
        }
    }
}

impl From<Frame> for RawFrame {
    fn from(frame: Frame) -> Self {
        let kind = frame.kind().to_string();
        let (text, code) = match frame {
            Frame::Receive { text } => (text, None),
            Frame::Disconnect { code } => (None, code),
            Frame::Connect | Frame::Unknown { .. } => (None, None),
        };
        Self { kind, text, code }
    }
}

/// One outbound protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Complete the opening handshake.
    Accept,
    /// Deliver a text message.
    Send {
        /// JSON-encoded payload.
        text: String,
    },
    /// Close the connection.
    Close {
        /// Close code.
        code: u16,
    },
}
