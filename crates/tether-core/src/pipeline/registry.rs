//! Middleware registry.
//!
//! Maps configuration identifiers to middleware constructors. The configured
//! list is resolved once at startup; an unknown identifier is an error there
//! and never at connection time.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::{Middleware, Pipeline, metrics_middleware, tracing_middleware};
use crate::errors::PipelineError;

/// Builds a fresh middleware instance.
pub type MiddlewareFactory = Arc<dyn Fn() -> Middleware + Send + Sync>;

/// Named middleware constructors.
#[derive(Default)]
pub struct MiddlewareRegistry {
    factories: IndexMap<String, MiddlewareFactory>,
}

impl MiddlewareRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `"tracing"` and `"metrics"`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("tracing", tracing_middleware);
        registry.register("metrics", metrics_middleware);
        registry
    }

    /// Register a constructor under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Middleware + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(name = %name, "registering middleware");
        let _ = self.factories.insert(name, Arc::new(factory));
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered identifiers in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the middleware named by each identifier, in order.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Middleware>, PipelineError> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.factories
                    .get(name)
                    .map(|factory| factory())
                    .ok_or_else(|| PipelineError::UnknownMiddleware(name.to_string()))
            })
            .collect()
    }

    /// Resolve `names` and compose them into a pipeline.
    pub fn build_pipeline<S: AsRef<str>>(&self, names: &[S]) -> Result<Pipeline, PipelineError> {
        let middleware = self.resolve(names)?;
        debug!(layers = middleware.len(), "middleware pipeline built");
        Ok(Pipeline::new(middleware))
    }
}

impl std::fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{LoopHandle, from_fn};
    use assert_matches::assert_matches;
    use futures::FutureExt;

    fn passthrough() -> Middleware {
        from_fn(|session, next| async move { next.run(session).await }.boxed())
    }

    #[test]
    fn builtins_registered() {
        let registry = MiddlewareRegistry::with_builtins();
        assert!(registry.contains("tracing"));
        assert!(registry.contains("metrics"));
        assert_eq!(registry.names(), vec!["tracing", "metrics"]);
    }

    #[test]
    fn resolves_in_configured_order() {
        let mut registry = MiddlewareRegistry::with_builtins();
        registry.register("audit", passthrough);

        let pipeline = registry
            .build_pipeline(&["audit", "tracing", "metrics"])
            .unwrap();
        assert_eq!(pipeline.depth(), 3);
    }

    #[test]
    fn unknown_name_fails_at_build() {
        let registry = MiddlewareRegistry::with_builtins();
        let err = registry
            .build_pipeline(&["tracing".to_string(), "auth".to_string()])
            .unwrap_err();
        assert_matches!(err, PipelineError::UnknownMiddleware(ref name) if name == "auth");
        assert_eq!(err.to_string(), "unknown middleware: auth");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = MiddlewareRegistry::new();
        registry.register("x", passthrough);
        registry.register("x", || Arc::new(|inner: LoopHandle| inner) as Middleware);
        assert_eq!(registry.names(), vec!["x"]);
        assert_eq!(registry.resolve(&["x"]).unwrap().len(), 1);
    }

    #[test]
    fn empty_list_gives_bare_pipeline() {
        let registry = MiddlewareRegistry::new();
        let names: Vec<String> = Vec::new();
        assert_eq!(registry.build_pipeline(&names).unwrap().depth(), 0);
    }
}
