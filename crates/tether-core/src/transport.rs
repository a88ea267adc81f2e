//! Transport seams: where frames come from and where envelopes go.
//!
//! A [`FrameSource`] is consumed only by the connection's message loop. An
//! [`EnvelopeSink`] is shared by the loop and every background task, so it
//! takes `&self`.
//!
//! Tokio channels implement both traits, which makes an in-memory transport
//! ([`channel`]) for embedding and tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::frame::{ABNORMAL_CLOSURE, Envelope, Frame};

/// Produces inbound frames, suspending until one is available.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame.
    async fn recv(&mut self) -> Result<Frame, TransportError>;
}

/// Accepts outbound envelopes.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Hand an envelope to the transport.
    ///
    /// Fails with [`TransportError::ClosedOk`] or
    /// [`TransportError::ClosedAbnormal`] once the connection is gone.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// A closed channel reads as an abnormal disconnect.
#[async_trait]
impl FrameSource for mpsc::Receiver<Frame> {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        Ok(mpsc::Receiver::recv(self)
            .await
            .unwrap_or(Frame::Disconnect {
                code: Some(ABNORMAL_CLOSURE),
            }))
    }
}

/// A dropped receiver reads as an abnormal closure.
#[async_trait]
impl EnvelopeSink for mpsc::Sender<Envelope> {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        mpsc::Sender::send(self, envelope)
            .await
            .map_err(|_| TransportError::ClosedAbnormal { code: None })
    }
}

/// The far side of an in-memory transport.
pub struct ChannelPeer {
    frames: mpsc::Sender<Frame>,
    envelopes: mpsc::Receiver<Envelope>,
}

impl ChannelPeer {
    /// Deliver a frame to the connection.
    ///
    /// Returns `false` if the connection has dropped its frame source.
    pub async fn push(&self, frame: Frame) -> bool {
        self.frames.send(frame).await.is_ok()
    }

    /// Deliver a `connect` frame.
    pub async fn connect(&self) -> bool {
        self.push(Frame::Connect).await
    }

    /// Deliver a `receive` frame with a text payload.
    pub async fn text(&self, text: impl Into<String>) -> bool {
        self.push(Frame::text(text)).await
    }

    /// Deliver a `disconnect` frame.
    pub async fn disconnect(&self) -> bool {
        self.push(Frame::disconnect()).await
    }

    /// Wait for the next envelope the connection sent.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        self.envelopes.recv().await
    }

    /// Take an envelope if one is already queued.
    pub fn try_next_envelope(&mut self) -> Option<Envelope> {
        self.envelopes.try_recv().ok()
    }

    /// Stop reading envelopes; later sends fail as closed.
    pub fn close_outbound(&mut self) {
        self.envelopes.close();
    }
}

/// Build an in-memory transport with `capacity` slots in each direction.
///
/// Returns the peer handle plus the source and sink to give the connection.
pub fn channel(
    capacity: usize,
) -> (ChannelPeer, mpsc::Receiver<Frame>, mpsc::Sender<Envelope>) {
    let (frame_tx, frame_rx) = mpsc::channel(capacity);
    let (envelope_tx, envelope_rx) = mpsc::channel(capacity);
    let peer = ChannelPeer {
        frames: frame_tx,
        envelopes: envelope_rx,
    };
    (peer, frame_rx, envelope_tx)
}
