//! `TetherServer`: axum HTTP server that upgrades routed paths into sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::{ConnectionHandler, ConnectionRequest, Engine, LifecycleError};
use tether_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::adapter;
use crate::health::{self, HealthResponse};
use crate::routes::{HandlerFactory, RouteParams, RouteTable};

/// Close code sent to open connections when the server shuts down.
pub const GOING_AWAY: u16 = 1001;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    http_fallback: Router,
    active: Arc<AtomicUsize>,
    start_time: Instant,
    send_queue: usize,
    shutdown: CancellationToken,
}

/// The tether HTTP + WebSocket server.
pub struct TetherServer {
    config: ServerSettings,
    engine: Engine,
    routes: Arc<RouteTable>,
    http_fallback: Router,
    metrics: Option<PrometheusHandle>,
    active: Arc<AtomicUsize>,
    start_time: Instant,
    shutdown: CancellationToken,
}

impl TetherServer {
    /// Create a server for `routes`, running sessions on `engine`.
    pub fn new(config: ServerSettings, engine: Engine, routes: RouteTable) -> Self {
        Self {
            config,
            engine,
            routes: Arc::new(routes),
            http_fallback: Router::new(),
            metrics: None,
            active: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve non-upgrade requests with `router` instead of a 404.
    #[must_use]
    pub fn with_http_fallback(mut self, router: Router) -> Self {
        self.http_fallback = router;
        self
    }

    /// Expose `GET /metrics` from a Prometheus recorder.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router.
    ///
    /// Every route pattern is mounted next to `/health` (and `/metrics`);
    /// unmatched requests go to the HTTP fallback.
    ///
    /// # Panics
    ///
    /// When a route pattern is invalid or overlaps another one in axum's
    /// matcher, `/health` included.
    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            http_fallback: self.http_fallback.clone(),
            active: Arc::clone(&self.active),
            start_time: self.start_time,
            send_queue: self.config.send_queue,
            shutdown: self.shutdown.clone(),
        };

        let mut router = Router::new().route("/health", get(health_handler));
        if let Some(handle) = self.metrics.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let body = handle.render();
                    async move { body }
                }),
            );
        }
        for (pattern, factory) in self.routes.iter() {
            let factory = Arc::clone(factory);
            router = router.route(
                pattern,
                any(
                    move |State(state): State<AppState>,
                          params: Option<Path<Vec<(String, String)>>>,
                          request: Request| {
                        let params: RouteParams = params
                            .map(|Path(params)| params.into_iter().collect())
                            .unwrap_or_default();
                        upgrade_route(state, Arc::clone(&factory), params, request)
                    },
                ),
            );
        }
        router.fallback(forward_http).with_state(state)
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// Returns the bound address and the server task, which finishes after
    /// [`shutdown`](Self::shutdown).
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "server terminated");
            }
        });

        info!(%addr, routes = ?self.routes.patterns(), "tether server listening");
        Ok((addr, handle))
    }

    /// Stop accepting requests and close open connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sessions currently running.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerSettings {
        &self.config
    }

    /// The session engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.active.load(Ordering::Relaxed);
    Json(health::health_check(state.start_time, connections))
}

/// Upgrade a request that matched a route; without an upgrade it goes to
/// the HTTP fallback.
async fn upgrade_route(
    state: AppState,
    factory: HandlerFactory,
    params: RouteParams,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => {
            let request = connection_request(&parts, params);
            let handler = factory(&request, request.params());
            upgrade
                .on_upgrade(move |socket| serve_socket(socket, state, request, handler))
                .into_response()
        }
        Err(rejection) => {
            debug!(path = %parts.uri.path(), %rejection, "routed path without upgrade");
            forward_http(State(state), Request::from_parts(parts, body)).await
        }
    }
}

async fn forward_http(State(state): State<AppState>, request: Request) -> Response {
    match state.http_fallback.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn connection_request(parts: &Parts, params: RouteParams) -> ConnectionRequest {
    let mut request = ConnectionRequest::new(parts.uri.path()).with_params(params);
    if let Some(query) = parts.uri.query() {
        request = request.with_query(query);
    }
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    request
}

async fn serve_socket(
    socket: WebSocket,
    state: AppState,
    request: ConnectionRequest,
    handler: Arc<dyn ConnectionHandler>,
) {
    let path = request.path().to_string();
    let (source, sink, _writer) = adapter::split(socket, state.send_queue);
    let mut session = state.engine.create(request, source, sink, handler);
    let _active = ActiveGuard::enter(&state.active);

    let conn = session.connection().clone();
    let shutdown = state.shutdown.clone();
    let watcher = tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("closing connection for shutdown");
                let _ = conn.close_with(GOING_AWAY).await;
            }
            () = conn.closed() => {}
        }
    });

    match session.run().await {
        Ok(()) => debug!(path = %path, "session finished"),
        Err(LifecycleError::Rejected(reason)) => {
            warn!(path = %path, reason = %reason, "connection rejected");
        }
        Err(err) => error!(path = %path, error = %err, kind = err.kind(), "session failed"),
    }
    watcher.abort();
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        let _ = active.fetch_add(1, Ordering::Relaxed);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
