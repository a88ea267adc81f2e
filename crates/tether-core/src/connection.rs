//! Per-connection state and the outbound send guard.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tether_settings::ConnectionSettings;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{BoxError, LifecycleError, Result};
use crate::frame::{Envelope, NORMAL_CLOSURE};
use crate::interval::{self, DEFAULT_HEARTBEAT_CADENCE, DEFAULT_POLL_INTERVAL};
use crate::request::ConnectionRequest;
use crate::supervisor::{DoneCallback, TaskErrorHook, TaskSupervisor};
use crate::transport::EnvelopeSink;

/// Task identifier used by [`Connection::start_ping`].
pub const PING_TASK_ID: &str = "ping";

/// Tunables applied to every connection an engine creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Minimum spacing between heartbeat pings.
    pub heartbeat_cadence: Duration,
    /// Wake-up granularity of the heartbeat scheduler.
    pub poll_interval: Duration,
    /// Report cancelled background tasks to the task error hook.
    pub process_cancel_errors: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_cadence: DEFAULT_HEARTBEAT_CADENCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            process_cancel_errors: false,
        }
    }
}

impl From<&ConnectionSettings> for ConnectionOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            heartbeat_cadence: Duration::from_millis(settings.heartbeat_cadence_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            process_cancel_errors: settings.process_cancel_errors,
        }
    }
}

struct Inner {
    request: ConnectionRequest,
    sink: Box<dyn EnvelopeSink>,
    connected: AtomicBool,
    closed: CancellationToken,
    supervisor: TaskSupervisor,
    options: ConnectionOptions,
}

/// Handle to one upgraded connection.
///
/// Cloning is cheap; background tasks keep their own clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Bind connection state to an outbound sink.
    pub fn new(
        request: ConnectionRequest,
        sink: Box<dyn EnvelopeSink>,
        options: ConnectionOptions,
        task_error_hook: TaskErrorHook,
    ) -> Self {
        let supervisor =
            TaskSupervisor::new(task_error_hook).with_cancel_errors(options.process_cancel_errors);
        Self {
            inner: Arc::new(Inner {
                request,
                sink,
                connected: AtomicBool::new(false),
                closed: CancellationToken::new(),
                supervisor,
                options,
            }),
        }
    }

    /// The request this connection was upgraded from.
    pub fn request(&self) -> &ConnectionRequest {
        &self.inner.request
    }

    /// Options the connection was created with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Whether the opening handshake completed and teardown has not started.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether the connection is closed. Never goes back to `false`.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub(crate) fn mark_connected(&self) -> bool {
        !self.inner.connected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.cancel();
    }

    /// Hand an envelope to the transport.
    ///
    /// A transport that reports the connection as closed flips the closed
    /// flag instead of returning an error. Other transport failures propagate.
    pub async fn send_raw(&self, envelope: Envelope) -> Result<()> {
        match self.inner.sink.send(envelope).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_closed() => {
                debug!(path = self.request().path(), error = %err, "send on closed connection dropped");
                self.mark_closed();
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Send the accept envelope.
    pub async fn accept(&self) -> Result<()> {
        self.send_raw(Envelope::Accept).await
    }

    /// JSON-encode `data` and send it as a text message.
    ///
    /// Nothing is sent if encoding fails.
    pub async fn send<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let text = serde_json::to_string(data).map_err(LifecycleError::Encode)?;
        self.send_raw(Envelope::Send { text }).await
    }

    /// Close with the normal closure code.
    pub async fn close(&self) -> Result<()> {
        self.close_with(NORMAL_CLOSURE).await
    }

    /// Mark the connection closed, then send a close envelope with `code`.
    pub async fn close_with(&self, code: u16) -> Result<()> {
        self.mark_closed();
        self.send_raw(Envelope::Close { code }).await
    }

    /// The connection's task supervisor.
    pub fn tasks(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    /// Run `activity` in the background under `task_id`.
    ///
    /// See [`TaskSupervisor::start_task`].
    pub fn start_task<F, E>(
        &self,
        task_id: impl Into<String>,
        activity: F,
        on_done: Option<DoneCallback>,
    ) where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.inner.supervisor.start_task(task_id, activity, on_done);
    }

    /// Cancel the background task under `task_id`.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.inner.supervisor.cancel(task_id)
    }

    /// Request cancellation of every background task.
    pub fn cancel_tasks(&self) -> usize {
        self.inner.supervisor.cancel_all()
    }

    /// Start the heartbeat under [`PING_TASK_ID`].
    ///
    /// Replaces a heartbeat that is already running.
    pub fn start_ping(&self) {
        let conn = self.clone();
        let cadence = self.inner.options.heartbeat_cadence;
        let poll = self.inner.options.poll_interval;
        let heartbeat = async move {
            interval::repeat(
                move || {
                    let conn = conn.clone();
                    async move { conn.send_ping().await }
                },
                cadence,
                poll,
            )
            .await
        };
        self.start_task(PING_TASK_ID, heartbeat, None);
    }

    /// Send one `{"ping": <utc timestamp>}` message.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(&serde_json::json!({ "ping": Utc::now().to_rfc3339() }))
            .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.inner.request.path())
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .field("tasks", &self.inner.supervisor)
            .finish_non_exhaustive()
    }
}
