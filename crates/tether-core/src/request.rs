//! Inbound connection request metadata.

use indexmap::IndexMap;

/// Metadata of the request that was upgraded into a connection.
///
/// Built by the router from transport metadata and handed to the handler
/// untouched. Upgraded connections are always `GET` requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    params: IndexMap<String, String>,
}

impl ConnectionRequest {
    /// Request for `path` with no query, headers or route params.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the raw query string (without the leading `?`).
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach the parameters captured by the route pattern.
    #[must_use]
    pub fn with_params(mut self, params: IndexMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Always `GET`.
    pub fn method(&self) -> &'static str {
        "GET"
    }

    /// All headers in arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Route parameter captured under `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// All route parameters in pattern order.
    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_fields() {
        let mut params = IndexMap::new();
        let _ = params.insert("room".to_string(), "lobby".to_string());
        let request = ConnectionRequest::new("/ws/rooms/lobby")
            .with_query("token=abc")
            .with_header("Origin", "http://localhost")
            .with_params(params);

        assert_eq!(request.path(), "/ws/rooms/lobby");
        assert_eq!(request.query(), Some("token=abc"));
        assert_eq!(request.method(), "GET");
        assert_eq!(request.param("room"), Some("lobby"));
        assert_eq!(request.param("missing"), None);
        assert_eq!(request.headers().len(), 1);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let request = ConnectionRequest::new("/")
            .with_header("Sec-WebSocket-Protocol", "chat")
            .with_header("sec-websocket-protocol", "later");
        assert_eq!(request.header("SEC-WEBSOCKET-PROTOCOL"), Some("chat"));
        assert_eq!(request.header("cookie"), None);
    }

    #[test]
    fn empty_query_is_none() {
        assert_eq!(ConnectionRequest::new("/").with_query("").query(), None);
    }
}
