//! Middleware composed around the connection loop.
//!
//! A [`Middleware`] turns one [`LoopHandle`] into another with the same
//! signature. [`Pipeline::new`] folds the list from the back, so the first
//! entry ends up outermost and the core loop innermost:
//!
//! ```text
//! [A, B]  =>  A( B( core ) )
//! ```
//!
//! A layer decides whether, when and how often to call the loop it wraps.
//! Returning without calling it rejects the connection.

mod builtin;
mod registry;

pub use builtin::{metrics_middleware, tracing_middleware};
pub use registry::{MiddlewareFactory, MiddlewareRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::errors::Result;
use crate::session::Session;

/// An entry point that runs a session to completion.
#[async_trait]
pub trait RunLoop: Send + Sync {
    /// Run `session` until its loop exits.
    async fn run(&self, session: &mut Session) -> Result<()>;
}

/// Shared handle to a loop entry point.
pub type LoopHandle = Arc<dyn RunLoop>;

/// Wraps a loop entry point into a new one.
pub type Middleware = Arc<dyn Fn(LoopHandle) -> LoopHandle + Send + Sync>;

struct CoreLoop;

#[async_trait]
impl RunLoop for CoreLoop {
    async fn run(&self, session: &mut Session) -> Result<()> {
        session.run_core().await
    }
}

/// The core loop wrapped in an ordered middleware chain.
pub struct Pipeline {
    entry: LoopHandle,
    depth: usize,
}

impl Pipeline {
    /// Compose `middleware` around the core loop, first entry outermost.
    pub fn new(middleware: Vec<Middleware>) -> Self {
        let depth = middleware.len();
        let core: LoopHandle = Arc::new(CoreLoop);
        let entry = middleware
            .iter()
            .rev()
            .fold(core, |inner, layer| layer(inner));
        Self { entry, depth }
    }

    /// The bare core loop.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of middleware layers.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run `session` through every layer.
    pub async fn run(&self, session: &mut Session) -> Result<()> {
        self.entry.run(session).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// The rest of the chain, as seen from a [`from_fn`] layer.
#[derive(Clone)]
pub struct Next {
    inner: LoopHandle,
}

impl Next {
    /// Call through to the wrapped loop.
    pub async fn run(&self, session: &mut Session) -> Result<()> {
        self.inner.run(session).await
    }
}

/// Build a middleware from an async closure.
///
/// ```ignore
/// let audit = from_fn(|session, next| {
///     async move {
///         tracing::info!(path = session.request().path(), "audit");
///         next.run(session).await
///     }
///     .boxed()
/// });
/// ```
pub fn from_fn<F>(f: F) -> Middleware
where
    F: for<'a> Fn(&'a mut Session, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |inner: LoopHandle| -> LoopHandle {
        Arc::new(FnLayer {
            f: Arc::clone(&f),
            next: Next { inner },
        })
    })
}

struct FnLayer<F> {
    f: Arc<F>,
    next: Next,
}

#[async_trait]
impl<F> RunLoop for FnLayer<F>
where
    F: for<'a> Fn(&'a mut Session, Next) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    async fn run(&self, session: &mut Session) -> Result<()> {
        (self.f)(session, self.next.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LifecycleError;
    use crate::handler::ConnectionHandler;
    use crate::request::ConnectionRequest;
    use crate::session::Engine;
    use crate::transport::channel;
    use assert_matches::assert_matches;
    use futures::FutureExt;
    use parking_lot::Mutex;

    struct Noop;
    impl ConnectionHandler for Noop {}

    fn recording(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
        from_fn(move |session, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:enter"));
                let outcome = next.run(session).await;
                log.lock().push(format!("{name}:exit"));
                outcome
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            recording("a", Arc::clone(&log)),
            recording("b", Arc::clone(&log)),
        ]);
        assert_eq!(pipeline.depth(), 2);

        let engine = Engine::new(pipeline, crate::ConnectionOptions::default());
        let (peer, source, sink) = channel(4);
        let mut session = engine.create(ConnectionRequest::new("/"), source, sink, Arc::new(Noop));
        assert!(peer.disconnect().await);
        session.run().await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:enter", "b:enter", "b:exit", "a:exit"]
        );
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reject = from_fn(|_session, _next| {
            async { Err(LifecycleError::rejected("closed for maintenance")) }.boxed()
        });
        let pipeline = Pipeline::new(vec![reject, recording("b", Arc::clone(&log))]);

        let engine = Engine::new(pipeline, crate::ConnectionOptions::default());
        let (_peer, source, sink) = channel(4);
        let mut session = engine.create(ConnectionRequest::new("/"), source, sink, Arc::new(Noop));

        let err = session.run().await.unwrap_err();
        assert_matches!(err, LifecycleError::Rejected(_));
        assert!(log.lock().is_empty());
        assert!(!session.is_finished());
    }

    #[tokio::test]
    async fn empty_pipeline_runs_core_loop() {
        let pipeline = Pipeline::empty();
        assert_eq!(pipeline.depth(), 0);

        let engine = Engine::new(pipeline, crate::ConnectionOptions::default());
        let (peer, source, sink) = channel(4);
        let mut session = engine.create(ConnectionRequest::new("/"), source, sink, Arc::new(Noop));
        assert!(peer.disconnect().await);
        session.run().await.unwrap();
        assert!(session.connection().is_closed());
    }
}
