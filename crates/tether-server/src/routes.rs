//! Connection routes: path patterns mapped to handler factories.
//!
//! Patterns use axum's syntax (`/ws/rooms/{room}`) and are mounted on the
//! server's axum [`Router`](axum::Router), so matching follows axum: a
//! literal segment beats a `{capture}` at the same position, and a request
//! that matches no pattern goes to the HTTP fallback.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tether_core::{ConnectionHandler, ConnectionRequest};

/// Parameters captured by a route pattern, in pattern order.
pub type RouteParams = IndexMap<String, String>;

/// Builds the handler for one accepted connection.
pub type HandlerFactory =
    Arc<dyn Fn(&ConnectionRequest, &RouteParams) -> Arc<dyn ConnectionHandler> + Send + Sync>;

/// Route patterns in registration order.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: IndexMap<String, HandlerFactory>,
}

impl RouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route whose factory receives the request and captured params.
    ///
    /// Registering the same pattern twice replaces the earlier factory.
    /// Patterns that axum considers overlapping (`/ws/{a}` next to
    /// `/ws/{b}`) make [`TetherServer::router`](crate::TetherServer::router)
    /// panic.
    #[must_use]
    pub fn route<F>(mut self, pattern: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ConnectionRequest, &RouteParams) -> Arc<dyn ConnectionHandler>
            + Send
            + Sync
            + 'static,
    {
        let _ = self.routes.insert(pattern.into(), Arc::new(factory));
        self
    }

    /// Add a route served by one shared handler instance.
    #[must_use]
    pub fn handler(self, pattern: impl Into<String>, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.route(pattern, move |_, _| Arc::clone(&handler))
    }

    /// The factory registered under exactly `pattern`.
    pub fn get(&self, pattern: &str) -> Option<&HandlerFactory> {
        self.routes.get(pattern)
    }

    /// Patterns with their factories, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HandlerFactory)> {
        self.routes.iter().map(|(p, f)| (p.as_str(), f))
    }

    /// Registered patterns in order.
    pub fn patterns(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("patterns", &self.patterns())
            .finish()
    }
}
