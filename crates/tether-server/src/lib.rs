//! # tether-server
//!
//! Reference router and transport adapter for `tether-core` on axum.
//!
//! - [`routes`]: path patterns with `{param}` captures mapped to handler factories
//! - [`adapter`]: an upgraded axum `WebSocket` as a frame source plus envelope sink
//! - [`server`]: `/health`, `/metrics`, one upgrading route per pattern, and a
//!   fallback that forwards to a plain HTTP router
//! - [`echo`]: demo handlers used by the binary

#![deny(unsafe_code)]

pub mod adapter;
pub mod echo;
pub mod health;
pub mod routes;
pub mod server;

pub use routes::{HandlerFactory, RouteParams, RouteTable};
pub use server::TetherServer;
