//! The two seams the core is generic over: the protocol handler invoked
//! per connection, and the dispatcher that spawns connection tasks.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::SpawnError;

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Protocol-specific connection handler.
///
/// Invoked exactly once per accepted connection with the connection's
/// input stream, output stream, and cancellation context. The handler is
/// opaque to the core: it may perform arbitrarily many sequential
/// read/write exchanges (pipelining) before returning, and it is expected
/// to unwind when the cancellation signal fires. Stream errors are
/// terminal for that connection only.
///
/// Implemented for any `Fn(OwnedReadHalf, OwnedWriteHalf,
/// CancellationToken)` returning a sendable `io::Result<()>` future, so a
/// plain `async fn` works:
///
/// ```rust,ignore
/// async fn echo(
///     mut input: OwnedReadHalf,
///     mut output: OwnedWriteHalf,
///     _cancel: CancellationToken,
/// ) -> std::io::Result<()> {
///     tokio::io::copy(&mut input, &mut output).await.map(|_| ())
/// }
///
/// let server = moorage_server::start(ServerSettings::default(), echo);
/// ```
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handles one connection until it is done or cancelled.
    fn handle(
        &self,
        input: OwnedReadHalf,
        output: OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> BoxFuture<io::Result<()>>;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(OwnedReadHalf, OwnedWriteHalf, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        input: OwnedReadHalf,
        output: OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> BoxFuture<io::Result<()>> {
        Box::pin(self(input, output, cancel))
    }
}

/// Fallible task spawning.
///
/// Spawning a connection task is modeled as an operation that can be
/// refused, so the accept loop's reject-and-close path is an ordinary
/// branch rather than exception handling. An implementation that rejects a
/// task must drop the future, which closes the rejected connection's
/// socket and releases its registry entry.
pub trait Dispatch: Send + Sync + 'static {
    /// Spawns the task, or refuses it.
    fn spawn(&self, task: BoxFuture<()>) -> Result<(), SpawnError>;
}

/// Dispatcher backed by a Tokio runtime handle. Never refuses work.
#[derive(Debug, Clone)]
pub struct TokioDispatch {
    handle: Handle,
}

impl TokioDispatch {
    /// Creates a dispatcher that spawns onto the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a dispatcher for the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Dispatch for TokioDispatch {
    fn spawn(&self, task: BoxFuture<()>) -> Result<(), SpawnError> {
        self.handle.spawn(task);
        Ok(())
    }
}
