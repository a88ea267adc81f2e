//! The connection message loop.
//!
//! An [`Engine`] is built once per process and creates one [`Session`] per
//! upgraded connection. [`Session::run`] drives the session through the
//! middleware pipeline down to the core loop:
//!
//! ```text
//! INIT --connect--> OPEN --disconnect / failure--> CLOSING --> CLOSED
//! ```
//!
//! Teardown always cancels the connection's tasks and calls `on_close`,
//! including after a fatal failure, which is returned afterwards.

use std::sync::Arc;

use serde_json::Value;
use tether_settings::ConnectionSettings;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::errors::{LifecycleError, PipelineError, Result, TaskError};
use crate::frame::Frame;
use crate::handler::ConnectionHandler;
use crate::pipeline::{MiddlewareRegistry, Pipeline};
use crate::request::ConnectionRequest;
use crate::supervisor::TaskErrorHook;
use crate::transport::{EnvelopeSink, FrameSource};

/// Process-wide session factory.
///
/// Holds the middleware pipeline and connection options shared by every
/// connection.
#[derive(Clone)]
pub struct Engine {
    pipeline: Arc<Pipeline>,
    options: ConnectionOptions,
}

impl Engine {
    /// Create an engine from a built pipeline.
    pub fn new(pipeline: Pipeline, options: ConnectionOptions) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            options,
        }
    }

    /// Resolve configured middleware and options.
    ///
    /// Unknown middleware identifiers fail here rather than per connection.
    pub fn from_settings(
        settings: &ConnectionSettings,
        registry: &MiddlewareRegistry,
    ) -> std::result::Result<Self, PipelineError> {
        let pipeline = registry.build_pipeline(&settings.middleware)?;
        Ok(Self::new(pipeline, ConnectionOptions::from(settings)))
    }

    /// Options applied to new connections.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The shared pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Bind a handler to a connection's transport.
    pub fn create(
        &self,
        request: ConnectionRequest,
        receive: impl FrameSource + 'static,
        send: impl EnvelopeSink + 'static,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Session {
        let hook_handler = Arc::clone(&handler);
        let hook: TaskErrorHook =
            Arc::new(move |task_id: &str, err: &TaskError| hook_handler.on_task_error(task_id, err));
        let connection = Connection::new(request, Box::new(send), self.options.clone(), hook);

        Session {
            connection,
            source: Box::new(receive),
            handler,
            pipeline: Arc::clone(&self.pipeline),
            finished: false,
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Pipeline::empty(), ConnectionOptions::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("middleware", &self.pipeline.depth())
            .field("options", &self.options)
            .finish()
    }
}

/// One connection's message loop.
pub struct Session {
    connection: Connection,
    source: Box<dyn FrameSource>,
    handler: Arc<dyn ConnectionHandler>,
    pipeline: Arc<Pipeline>,
    finished: bool,
}

impl Session {
    /// The connection handle.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The request the connection was upgraded from.
    pub fn request(&self) -> &ConnectionRequest {
        self.connection.request()
    }

    /// The application handler.
    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Whether teardown has run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Run the session through the middleware pipeline.
    ///
    /// Returns once the connection is closed, or with the failure that ended
    /// it. Teardown has already run in both cases. Running a finished session
    /// again fails with [`LifecycleError::Finished`].
    pub async fn run(&mut self) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        pipeline.run(self).await
    }

    /// The innermost loop, below all middleware.
    #[instrument(skip_all, fields(path = %self.connection.request().path()))]
    pub(crate) async fn run_core(&mut self) -> Result<()> {
        if self.finished {
            return Err(LifecycleError::Finished);
        }

        let outcome = self.process_frames().await;
        if let Err(err) = &outcome {
            error!(error = %err, "connection loop failed");
            self.handler.on_error(&self.connection, err).await;
        }

        self.teardown().await;
        outcome
    }

    async fn process_frames(&mut self) -> Result<()> {
        while !self.connection.is_closed() {
            let Some(frame) = self.next_frame().await? else {
                break;
            };
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    /// Wait for a frame, giving up as soon as the connection closes.
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let closed = self.connection.closed_token();
        tokio::select! {
            biased;
            () = closed.cancelled() => Ok(None),
            received = self.source.recv() => match received {
                Ok(frame) => Ok(Some(frame)),
                Err(err) if err.is_closed() => {
                    debug!(error = %err, "frame source closed");
                    self.connection.mark_closed();
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            },
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        debug!(kind = frame.kind(), "frame received");
        match frame {
            Frame::Connect => {
                if self.connection.is_connected() {
                    // One accept and one on_open per connection, even if the
                    // peer repeats the handshake.
                    warn!(
                        "duplicate connect frame ignored: connection already accepted, on_open not rerun"
                    );
                    return Ok(());
                }
                self.connection.accept().await?;
                let _ = self.connection.mark_connected();
                info!("connection opened");
                self.handler.on_open(&self.connection).await
            }
            Frame::Receive { text } => {
                let data = decode_payload(text.as_deref())?;
                self.handler.on_message(&self.connection, data).await
            }
            Frame::Disconnect { code } => {
                info!(?code, "peer disconnected");
                self.connection.mark_closed();
                Ok(())
            }
            Frame::Unknown { kind } => Err(LifecycleError::Protocol { kind }),
        }
    }

    async fn teardown(&mut self) {
        self.connection.mark_closed();
        self.connection.mark_disconnected();
        let cancelled = self.connection.cancel_tasks();
        debug!(cancelled, "connection tasks cancelled");
        self.handler.on_close(&self.connection).await;
        self.finished = true;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Missing or empty text decodes to `None`.
fn decode_payload(text: Option<&str>) -> Result<Option<Value>> {
    match text {
        None | Some("") => Ok(None),
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(LifecycleError::Decode),
    }
}
