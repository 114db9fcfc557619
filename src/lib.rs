//! Allocation-averse TCP server engine.
//!
//! A [`Server`] accepts connections, keeps one pooled receive context per
//! client (a leased segment of a preallocated buffer arena), and publishes
//! lifecycle and data [`Event`]s on an ordered stream. All connection state is
//! owned by a single engine task; I/O completions are posted back to it as
//! messages.
//!
//! ```no_run
//! use fastnet::{Client, Event, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), fastnet::ServerError> {
//! let server = Server::start(ServerConfig::default(), "0.0.0.0", 1337)?;
//! let mut events = server.subscribe();
//! while let Some(event) = events.recv().await {
//!     if let Event::DataReceived { client, data, .. } = event? {
//!         // echo
//!         server.send(client.id(), data);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod errors;
pub mod logging;
pub mod memory;

pub use crate::config::ServerConfig;
pub use crate::core::client::{BasicClient, Client, ClientFactory, ClientId, Connection};
pub use crate::core::context::{ContextPool, IoContext};
pub use crate::core::event::{Event, EventKind, EventQueue, EventStream};
pub use crate::core::server::{Server, ServerBuilder};
pub use crate::errors::{LogError, PoolError, ServerError};
pub use crate::memory::{BufferPool, Checkable, CheckablePool, ObjectPool, Pool, Segment};
