//! axum WebSocket adapter.
//!
//! Splits an upgraded [`WebSocket`] into the core's transport seams. Outbound
//! messages go through a bounded queue drained by a writer task, so sends
//! from background tasks never contend for the socket.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::{Envelope, EnvelopeSink, Frame, FrameSource, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Inbound half. The first frame is always a synthesized `connect`, since
/// axum completes the handshake before the session starts.
pub struct AxumFrameSource {
    stream: SplitStream<WebSocket>,
    connected: bool,
}

#[async_trait]
impl FrameSource for AxumFrameSource {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        if !self.connected {
            self.connected = true;
            return Ok(Frame::Connect);
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(error = %err, "websocket read failed");
                    return Err(TransportError::ClosedAbnormal { code: None });
                }
                None => return Err(TransportError::ClosedAbnormal { code: None }),
            };

            match message {
                Message::Text(text) => return Ok(Frame::text(text.as_str())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Frame::text(text)),
                    Err(_) => debug!(len = bytes.len(), "non-utf8 binary message dropped"),
                },
                Message::Close(frame) => {
                    return Ok(Frame::Disconnect {
                        code: frame.map(|f| f.code),
                    });
                }
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}

/// Outbound half: envelopes become messages on the writer queue.
#[derive(Clone)]
pub struct AxumEnvelopeSink {
    queue: mpsc::Sender<Message>,
}

#[async_trait]
impl EnvelopeSink for AxumEnvelopeSink {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let message = match envelope {
            // The upgrade response already accepted the connection.
            Envelope::Accept => return Ok(()),
            Envelope::Send { text } => Message::Text(Utf8Bytes::from(text)),
            Envelope::Close { code } => Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from_static(""),
            })),
        };
        self.queue
            .send(message)
            .await
            .map_err(|_| TransportError::ClosedAbnormal { code: None })
    }
}

/// Split `socket` into a frame source, an envelope sink and the writer task.
///
/// The writer stops after sending a close frame, after a write error, or once
/// every sink clone is dropped.
pub fn split(
    socket: WebSocket,
    queue_capacity: usize,
) -> (AxumFrameSource, AxumEnvelopeSink, JoinHandle<()>) {
    let (ws_tx, ws_rx) = socket.split();
    let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
    let writer = tokio::spawn(write_loop(ws_tx, queue_rx));

    (
        AxumFrameSource {
            stream: ws_rx,
            connected: false,
        },
        AxumEnvelopeSink { queue: queue_tx },
        writer,
    )
}

async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut queue: mpsc::Receiver<Message>) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = ws_tx.send(message).await {
            debug!(error = %err, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    // Later sends fail, which the send guard turns into the closed flag.
    queue.close();
    let _ = ws_tx.close().await;
}
