//! # Moorage
//!
//! **Connection acceptance and lifecycle core for async TCP servers.**
//!
//! Moorage owns everything between "bind a socket" and "every connection
//! is drained": an accept loop, one task per connection, a per-connection
//! idle timeout, and an orderly shutdown that never leaks sockets or
//! hangs. Protocol parsing and business logic stay outside, behind an
//! opaque per-connection handler callback.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use moorage::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ServerSettings::builder().port(8080).build();
//!     let mut server = start(settings, my_handler);
//!     let addr = server.bound_addr().await?;
//!     tracing::info!(%addr, "listening");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown_and_wait().await;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/moorage/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Re-export the server core
pub use moorage_server as server;

pub use moorage_server::{start, start_with, ServerHandle, ServerSettings};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use moorage::prelude::*;
///
/// let settings = ServerSettings::builder().port(0).build();
/// assert_eq!(settings.port(), 0);
/// ```
pub mod prelude {
    pub use moorage_server::{
        start, start_with, BoxFuture, ConnectionEntry, ConnectionHandler, ConnectionId,
        ConnectionRegistry, Dispatch, ServerError, ServerHandle, ServerSettings,
        ServerSettingsBuilder, SpawnError, TimeoutError, TokioDispatch,
    };
}
