//! # tether-core
//!
//! Lifecycle engine for one upgraded duplex connection.
//!
//! ## Pieces
//!
//! - [`Connection`]: connection state plus the send guard, which turns
//!   "already closed" transport errors into the closed flag
//! - [`interval::repeat`]: minimum-cadence repeating calls, used by the heartbeat
//! - [`TaskSupervisor`]: at most one live background task per identifier,
//!   failures observed exactly once, bulk cancellation on teardown
//! - [`Session`]: the frame loop driving [`ConnectionHandler`] hooks
//! - [`Pipeline`]: middleware wrapped around the loop, first entry outermost
//!
//! ## Example
//!
//! ```rust,ignore
//! let engine = Engine::default();
//! let (peer, source, sink) = tether_core::transport::channel(16);
//! let mut session = engine.create(ConnectionRequest::new("/ws"), source, sink, handler);
//! session.run().await?;
//! ```
//!
//! Transports plug in through [`FrameSource`] and [`EnvelopeSink`]. The core
//! never touches an HTTP framework.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod frame;
pub mod handler;
pub mod interval;
pub mod logging;
pub mod pipeline;
pub mod request;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use connection::{Connection, ConnectionOptions, PING_TASK_ID};
pub use errors::{BoxError, LifecycleError, PipelineError, Result, TaskError, TransportError};
pub use frame::{ABNORMAL_CLOSURE, Envelope, Frame, NORMAL_CLOSURE};
pub use handler::ConnectionHandler;
pub use pipeline::{Middleware, MiddlewareRegistry, Next, Pipeline, from_fn};
pub use request::ConnectionRequest;
pub use session::{Engine, Session};
pub use supervisor::{CancelReason, TaskSupervisor};
pub use transport::{EnvelopeSink, FrameSource};
