//! Application hooks.
//!
//! A [`ConnectionHandler`] supplies the behavior of one kind of connection.
//! The session calls its hooks as the lifecycle advances:
//!
//! - [`on_open`](ConnectionHandler::on_open) after the handshake is accepted
//! - [`on_message`](ConnectionHandler::on_message) for every data frame
//! - [`on_error`](ConnectionHandler::on_error) when the loop is about to fail
//! - [`on_close`](ConnectionHandler::on_close) once, during teardown
//!
//! An error returned from `on_open` or `on_message` ends the connection.
//! Failures of background tasks never do; they go to
//! [`on_task_error`](ConnectionHandler::on_task_error).

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::Connection;
use crate::errors::{LifecycleError, Result, TaskError};
use crate::supervisor::log_task_error;

/// Hooks for one kind of connection. Every hook has a no-op default.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// The connection was accepted.
    ///
    /// Typically starts the heartbeat with [`Connection::start_ping`].
    async fn on_open(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// A data frame arrived. `data` is `None` for an empty payload.
    async fn on_message(&self, _conn: &Connection, _data: Option<Value>) -> Result<()> {
        Ok(())
    }

    /// The connection is gone and its tasks have been cancelled.
    async fn on_close(&self, _conn: &Connection) {}

    /// The loop failed with `error`, which is returned after teardown.
    async fn on_error(&self, _conn: &Connection, _error: &LifecycleError) {}

    /// A background task failed, panicked, or (if configured) was cancelled.
    ///
    /// Defaults to logging the failure.
    fn on_task_error(&self, task_id: &str, error: &TaskError) {
        log_task_error(task_id, error);
    }
}
