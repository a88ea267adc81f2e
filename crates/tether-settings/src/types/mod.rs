//! The settings tree.
//!
//! Every struct uses `#[serde(rename_all = "camelCase")]` for the JSON file
//! format. Each type implements [`Default`] with production values, and
//! `#[serde(default)]` lets a partial file fill in the rest.

mod connection;
mod server;

pub use connection::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "connection": { "heartbeatCadenceMs": 30000, "middleware": ["tracing"] },
///   "server": { "port": 9090 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Per-connection lifecycle settings.
    pub connection: ConnectionSettings,
    /// Bind address and transport settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let conn = &self.connection;
        if conn.poll_interval_ms == 0 {
            return Err(SettingsError::invalid("connection.pollIntervalMs", "must be at least 1"));
        }
        if conn.poll_interval_ms > conn.heartbeat_cadence_ms {
            return Err(SettingsError::invalid(
                "connection.pollIntervalMs",
                format!(
                    "{} exceeds heartbeatCadenceMs {}",
                    conn.poll_interval_ms, conn.heartbeat_cadence_ms
                ),
            ));
        }
        if conn.middleware.iter().any(|m| m.trim().is_empty()) {
            return Err(SettingsError::invalid(
                "connection.middleware",
                "identifiers must not be blank",
            ));
        }
        if self.server.send_queue == 0 {
            return Err(SettingsError::invalid("server.sendQueue", "must be at least 1"));
        }
        Ok(())
    }
}
