//! A multi-threaded TCP session multiplexer: a fixed pool of I/O worker
//! threads, each running its own reactor, fanning accepted/connected/
//! associated connections across the pool and exposing a callback-driven
//! [`Service`] API to application code.
//!
//! Sessions are pinned to one worker for their full lifetime and are
//! touched only from that worker's thread; every cross-thread operation
//! ([`Layer::send`], [`Layer::shutdown`], [`Layer::perform`], ...) routes
//! through a per-worker task queue keyed by the worker bits packed into
//! the session's [`Sid`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use iolayer::{Layer, LayerConfig, Service, Ctx};
//!
//! struct Echo;
//! impl Service for Echo {
//!     fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
//!         buf.len() as i32
//!     }
//! }
//!
//! let layer = Layer::create(LayerConfig::default()).unwrap();
//! layer.listen(
//!     "127.0.0.1",
//!     17001,
//!     Arc::new(|_app: &Ctx, _io: &Ctx, _sid, _host: &str, _port| 0),
//!     Arc::new(()),
//! ).unwrap();
//! layer.stop();
//! layer.destroy();
//! ```

mod acceptor;
mod associator;
mod buffer;
mod connector;
mod error;
mod id;
mod layer;
mod service;
mod session;
mod table;
mod task;
mod timer;
mod worker;

pub use buffer::Payload;
pub use error::{Error, Result};
pub use id::Sid;
pub use layer::{Layer, LayerConfig};
pub use service::{Ctx, Service, SessionOrigin, ShutdownWay};
pub use task::{AssociateCallback, CloneFn, ConnectCallback, ConnectTarget, ListenCallback, PerformFn, RecycleFn, TransformFn};
