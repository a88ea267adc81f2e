//! Demo handlers served by the binary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::{Connection, ConnectionHandler, Result};
use tracing::debug;

use crate::routes::{RouteParams, RouteTable};

/// Echoes every message back as `{"echo": <message>}` and keeps a heartbeat.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_open(&self, conn: &Connection) -> Result<()> {
        conn.start_ping();
        Ok(())
    }

    async fn on_message(&self, conn: &Connection, data: Option<Value>) -> Result<()> {
        conn.send(&json!({ "echo": data })).await
    }
}

/// Echoes messages tagged with the room captured from the path.
#[derive(Debug)]
pub struct RoomHandler {
    room: String,
}

impl RoomHandler {
    /// Handler for `room`.
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }
}

#[async_trait]
impl ConnectionHandler for RoomHandler {
    async fn on_open(&self, conn: &Connection) -> Result<()> {
        debug!(room = %self.room, "joined room");
        conn.start_ping();
        conn.send(&json!({ "room": self.room, "joined": true })).await
    }

    async fn on_message(&self, conn: &Connection, data: Option<Value>) -> Result<()> {
        conn.send(&json!({ "room": self.room, "echo": data })).await
    }
}

/// `/ws/echo` and `/ws/rooms/{room}`.
pub fn demo_routes() -> RouteTable {
    RouteTable::new()
        .handler("/ws/echo", Arc::new(EchoHandler))
        .route("/ws/rooms/{room}", |_, params: &RouteParams| {
            let room = params.get("room").cloned().unwrap_or_default();
            Arc::new(RoomHandler::new(room)) as Arc<dyn ConnectionHandler>
        })
}
