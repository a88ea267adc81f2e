//! Built-in middleware.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tracing::{Instrument, info, info_span, warn};

use super::{LoopHandle, Middleware, RunLoop};
use crate::errors::Result;
use crate::session::Session;

/// Wraps each connection in a span carrying its path and logs how it ended.
pub fn tracing_middleware() -> Middleware {
    Arc::new(|inner: LoopHandle| -> LoopHandle { Arc::new(TracingLayer { inner }) })
}

/// Records connection counters, the active gauge and the duration histogram.
pub fn metrics_middleware() -> Middleware {
    Arc::new(|inner: LoopHandle| -> LoopHandle { Arc::new(MetricsLayer { inner }) })
}

struct TracingLayer {
    inner: LoopHandle,
}

#[async_trait]
impl RunLoop for TracingLayer {
    async fn run(&self, session: &mut Session) -> Result<()> {
        let span = info_span!("connection", path = %session.request().path());
        let inner = Arc::clone(&self.inner);
        async move {
            let started = Instant::now();
            info!("connection started");
            let outcome = inner.run(session).await;
            let elapsed = started.elapsed();
            match &outcome {
                Ok(()) => info!(?elapsed, "connection finished"),
                Err(err) => warn!(?elapsed, error = %err, kind = err.kind(), "connection failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

struct MetricsLayer {
    inner: LoopHandle,
}

#[async_trait]
impl RunLoop for MetricsLayer {
    async fn run(&self, session: &mut Session) -> Result<()> {
        let started = Instant::now();
        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);

        let outcome = self.inner.run(session).await;

        gauge!("ws_connections_active").decrement(1.0);
        histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
        match &outcome {
            Ok(()) => counter!("ws_disconnections_total").increment(1),
            Err(err) => counter!("ws_connection_failures_total", "kind" => err.kind()).increment(1),
        }
        outcome
    }
}
