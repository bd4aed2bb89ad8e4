//! # Strand-IO
//! A multi-reactor TCP transport for Rust built on single-threaded event
//! loops, without relying on heavyweight async runtimes like Tokio.
//! Strand-IO runs one [`mio`] poll per reactor thread, interleaving a task
//! queue with I/O polling, and spreads accepted connections across a worker
//! pool by passing socket descriptors over a local pipe, so every socket is
//! only ever touched by the one loop that owns it.
//! ## Core Philosophy
//! Strand-IO was designed for applications that require:
//! - **Predictable performance** with no cross-thread socket contention
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Direct control** over threads, shutdown, and backpressure
//! ## Features
//! - **Reactor executors**: submit closures to a loop thread, schedule
//!   delayed work, shut down gracefully with a quiet period
//! - **Channels**: non-blocking connect with a racing timeout, pull-based
//!   reads, batched backpressure-aware writes
//! - **Accept dispatch**: a dedicated accept loop round-robins connections
//!   to workers over an `SCM_RIGHTS` handoff pipe
//! - **Object pooling**: read buffers come from a per-loop pool
//! ## Architecture Overview
//! ```text
//! ┌────────────┐  accept   ┌──────────────┐  SCM_RIGHTS  ┌────────────┐
//! │ TcpServer  │──────────▶│  Dispatcher  │─────────────▶│  Worker    │
//! └────────────┘           │   Reactor    │ handoff pipe │  Reactors  │
//!                          └──────────────┘              └─────┬──────┘
//!                                                              │ adopt
//!                                                        ┌─────▼──────┐
//!                                                        │ TcpChannel │──▶ ChannelHandler
//!                                                        └────────────┘
//! ```
//! ## Quick Start
//!
//! An echo server:
//!
//! ```rust,no_run
//! use strand_io::{ChannelHandler, ServerConfig, TcpChannel, TcpServer};
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {
//!     fn on_read(&self, channel: &TcpChannel, data: &[u8]) {
//!         channel.write_and_flush(data.to_vec());
//!     }
//! }
//!
//! fn main() -> strand_io::Result<()> {
//!     let config = ServerConfig::builder()
//!         .address("127.0.0.1:8080".parse().unwrap())
//!         .workers(4)
//!         .build();
//!     let server = TcpServer::bind(config, Echo)?;
//!     println!("listening on {}", server.local_addr());
//!     server.dispatcher().termination_future().wait()?;
//!     Ok(())
//! }
//! ```
//!
//! A client connect:
//!
//! ```rust,no_run
//! use strand_io::{ChannelConfig, ChannelHandler, Reactor, TcpChannel};
//!
//! struct Print;
//! impl ChannelHandler for Print {
//!     fn on_read(&self, _channel: &TcpChannel, data: &[u8]) {
//!         println!("{}", String::from_utf8_lossy(data));
//!     }
//! }
//!
//! fn main() -> strand_io::Result<()> {
//!     let reactor = Reactor::new()?;
//!     reactor.start()?;
//!     let channel = TcpChannel::new(&reactor, ChannelConfig::default(), Print);
//!     channel.connect("127.0.0.1:8080".parse().unwrap(), None).wait()?;
//!     channel.write_and_flush(b"hello".to_vec()).wait()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`Reactor`]: a single-threaded executor interleaving tasks and I/O
//! - [`ReactorPool`]: a round-robin group of reactors
//! - [`TcpChannel`]: a connection bound to one reactor
//! - [`ChannelHandler`]: trait for lifecycle and data notifications
//! - [`TcpServer`]: accept dispatcher plus worker pool

pub mod channel;
pub mod config;
pub mod error;
pub mod group;
pub mod handler;
pub mod object_pool;
pub mod promise;
pub mod reactor;
pub mod server;

mod handle;
mod poll;

pub use channel::TcpChannel;
pub use config::{ChannelConfig, ChannelConfigBuilder, ServerConfig, ServerConfigBuilder};
pub use error::{Error, Result};
pub use group::ReactorPool;
pub use handler::ChannelHandler;
pub use object_pool::{ObjectPool, PooledObject};
pub use promise::{Promise, TerminationFuture};
pub use reactor::{Reactor, ScheduledHandle};
pub use server::TcpServer;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use strand_io::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::TcpChannel;
    pub use crate::config::{ChannelConfig, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::group::ReactorPool;
    pub use crate::handler::ChannelHandler;
    pub use crate::promise::Promise;
    pub use crate::reactor::Reactor;
    pub use crate::server::TcpServer;
}
