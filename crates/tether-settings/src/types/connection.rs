//! Connection lifecycle settings.

use serde::{Deserialize, Serialize};

/// Settings consumed when a connection session is constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Minimum spacing between heartbeat pings, in milliseconds.
    pub heartbeat_cadence_ms: u64,
    /// How often the interval scheduler wakes up to check the cadence.
    pub poll_interval_ms: u64,
    /// Report cancelled background tasks to the task error hook.
    pub process_cancel_errors: bool,
    /// Ordered middleware identifiers; the first entry is outermost.
    pub middleware: Vec<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_cadence_ms: 59_000,
            poll_interval_ms: 300,
            process_cancel_errors: false,
            middleware: Vec::new(),
        }
    }
}
