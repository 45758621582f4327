//! # Moorage Server
//!
//! Connection acceptance and lifecycle core for an asynchronous TCP
//! server. This crate owns the hard part of serving: it binds a listening
//! socket, accepts connections indefinitely, dispatches each to an
//! independent task, enforces a per-connection idle timeout, and performs
//! an orderly shutdown that closes the listener and drains all in-flight
//! connections before completing.
//!
//! What bytes mean is someone else's job: the protocol handler is an
//! opaque callback given the connection's input stream, output stream,
//! and a cooperative cancellation token.
//!
//! ## Example
//!
//! ```rust,ignore
//! use moorage_server::{start, ServerSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings::builder()
//!         .host("0.0.0.0")
//!         .port(8080)
//!         .build();
//!
//!     let mut server = start(settings, my_handler);
//!     let addr = server.bound_addr().await?;
//!     tracing::info!(%addr, "listening");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown_and_wait().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle guarantees
//!
//! - A connection is registered before its task is spawned, so a shutdown
//!   snapshot taken at any instant after accept observes it.
//! - Every connection task cancels its idle timer, closes its transport,
//!   and deregisters itself on every exit path.
//! - One connection's failure never affects the accept loop or its peers.
//! - Shutdown force-closes stragglers and reports stopped only once the
//!   registry is empty.

#![doc(html_root_url = "https://docs.rs/moorage-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod connection;

pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod settings;
pub mod timeout;

pub use error::{ServerError, SpawnError, TimeoutError};
pub use handler::{BoxFuture, ConnectionHandler, Dispatch, TokioDispatch};
pub use registry::{ConnectionEntry, ConnectionId, ConnectionRegistry};
pub use server::{start, start_with, ServerHandle};
pub use settings::{ServerSettings, ServerSettingsBuilder};
pub use timeout::{TimeoutKey, TimeoutQueue};
