//! Server start, accept loop, and shutdown sequencing.
//!
//! [`start`] launches the accept loop and returns a [`ServerHandle`]
//! synchronously; binding happens asynchronously and its outcome is
//! observed through [`ServerHandle::bound_addr`]. Cancelling the handle is
//! the sole shutdown trigger: the loop stops accepting, closes the
//! listener, tears down the timeout queue, and drains the connection
//! registry until it is observably empty before reporting stopped.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionTask;
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, Dispatch, TokioDispatch};
use crate::registry::{ConnectionEntry, ConnectionId, ConnectionRegistry, RegistryGuard};
use crate::settings::ServerSettings;
use crate::timeout::TimeoutQueue;

/// How long one drain pass waits for removals before force-closing again.
/// The repeat covers the race between forced close and organic close.
const DRAIN_RECHECK: Duration = Duration::from_millis(25);

type BoundAddr = Option<Result<SocketAddr, ServerError>>;

/// Starts a server on the current Tokio runtime.
///
/// Returns synchronously; await [`ServerHandle::bound_addr`] to observe
/// bind success or failure.
///
/// # Panics
///
/// Panics when called outside a Tokio runtime.
///
/// # Example
///
/// ```rust,ignore
/// let mut server = moorage_server::start(ServerSettings::default(), echo);
/// let addr = server.bound_addr().await?;
/// tracing::info!(%addr, "listening");
/// // ...
/// server.shutdown();
/// server.stopped().await;
/// ```
pub fn start<H>(settings: ServerSettings, handler: H) -> ServerHandle
where
    H: ConnectionHandler,
{
    let runtime = Handle::current();
    let dispatch = Arc::new(TokioDispatch::new(runtime.clone()));
    start_with(settings, &runtime, dispatch, handler)
}

/// Starts a server with explicit dispatch contexts.
///
/// `runtime` hosts the accept loop and the timeout waiter; `dispatch`
/// spawns connection tasks and may be a distinct context (or one that
/// refuses work, in which case the rejected connection is closed and
/// accepting continues).
pub fn start_with<H>(
    settings: ServerSettings,
    runtime: &Handle,
    dispatch: Arc<dyn Dispatch>,
    handler: H,
) -> ServerHandle
where
    H: ConnectionHandler,
{
    let cancel = CancellationToken::new();
    let registry = ConnectionRegistry::new();
    let (addr_tx, addr_rx) = watch::channel(None);

    let accept_loop = AcceptLoop {
        settings,
        runtime: runtime.clone(),
        dispatch,
        handler: Arc::new(handler),
        registry: registry.clone(),
        cancel: cancel.clone(),
    };
    let task = runtime.spawn(accept_loop.run(addr_tx));

    ServerHandle {
        task: Some(task),
        cancel,
        registry,
        addr_rx,
    }
}

/// Externally visible handle representing the server's lifetime.
///
/// Exactly one handle exists per server instance. Requesting shutdown
/// returns immediately; completion of draining is observed by awaiting
/// [`ServerHandle::stopped`].
pub struct ServerHandle {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    registry: ConnectionRegistry,
    addr_rx: watch::Receiver<BoundAddr>,
}

impl ServerHandle {
    /// A pre-cancelled sentinel representing a server that never started.
    /// Its address future is pre-failed with [`ServerError::Cancelled`].
    #[must_use]
    pub fn never_started() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_addr_tx, addr_rx) = watch::channel(Some(Err(ServerError::Cancelled)));
        Self {
            task: None,
            cancel,
            registry: ConnectionRegistry::new(),
            addr_rx,
        }
    }

    /// Resolves to the bound listening address, or the bind failure.
    ///
    /// Safe to await multiple times; the outcome is latched. When the
    /// server is cancelled before it ever binds, this yields
    /// [`ServerError::Cancelled`].
    pub async fn bound_addr(&mut self) -> Result<SocketAddr, ServerError> {
        loop {
            {
                let current = self.addr_rx.borrow_and_update();
                if let Some(outcome) = current.as_ref() {
                    return outcome.clone();
                }
            }
            if self.addr_rx.changed().await.is_err() {
                // Accept loop gone without publishing an outcome.
                return Err(ServerError::Shutdown);
            }
        }
    }

    /// Requests shutdown. Returns immediately; idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The live-connection registry, for observation (size, snapshots).
    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Resolves once the accept loop has fully drained and exited. The
    /// registry is guaranteed empty at that point.
    pub async fn stopped(mut self) {
        if let Some(task) = self.task.take() {
            // The accept loop never panics; a join error can only mean the
            // runtime is tearing down, which is equivalent to stopped.
            let _ = task.await;
        }
    }

    /// Convenience: request shutdown and wait for draining to complete.
    pub async fn shutdown_and_wait(self) {
        self.shutdown();
        self.stopped().await;
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("is_shutdown", &self.is_shutdown())
            .field("open_connections", &self.registry.len())
            .finish()
    }
}

/// The long-running loop that owns the listening socket.
struct AcceptLoop {
    settings: ServerSettings,
    runtime: Handle,
    dispatch: Arc<dyn Dispatch>,
    handler: Arc<dyn ConnectionHandler>,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self, addr_tx: watch::Sender<BoundAddr>) {
        let addr = self.settings.addr();

        // STARTING: bind, racing cancellation so that a handle cancelled at
        // birth fails its address future instead of resolving it.
        let listener = tokio::select! {
            () = self.cancel.cancelled() => {
                let _ = addr_tx.send(Some(Err(ServerError::Cancelled)));
                return;
            }
            bound = TcpListener::bind(&addr) => match bound {
                Ok(listener) => listener,
                Err(error) => {
                    tracing::warn!(%addr, %error, "failed to bind listener");
                    let _ = addr_tx.send(Some(Err(ServerError::bind(&addr, &error))));
                    return;
                }
            },
        };

        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(error) => {
                let _ = addr_tx.send(Some(Err(ServerError::bind(&addr, &error))));
                return;
            }
        };
        let _ = addr_tx.send(Some(Ok(local_addr)));
        tracing::info!(addr = %local_addr, "server listening");

        let timeouts = TimeoutQueue::new();
        {
            let timeouts = timeouts.clone();
            self.runtime.spawn(async move { timeouts.run().await });
        }

        // LISTENING: accept until cancelled. Accept errors are logged and
        // the loop continues; one bad accept must not stop the server.
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch_connection(stream, peer, &timeouts),
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept connection");
                    }
                },
            }
        }

        // STOPPING: close the listener first so no new work arrives, tear
        // down the timer service, then drain the registry.
        drop(listener);
        timeouts.close();
        self.drain().await;
        tracing::info!(addr = %local_addr, "server stopped");
    }

    /// DISPATCHING: register the entry before spawning so any shutdown
    /// snapshot taken after this point observes the connection. A refused
    /// spawn drops the task future, which closes the socket and releases
    /// the entry through its guard; the loop returns to accepting at once.
    fn dispatch_connection(&self, stream: TcpStream, peer: SocketAddr, timeouts: &TimeoutQueue) {
        let id = ConnectionId::next();
        let token = CancellationToken::new();
        self.registry
            .add(ConnectionEntry::new(id, peer, token.clone()));
        let guard = RegistryGuard::new(self.registry.clone(), id);

        tracing::debug!(connection = %id, peer = %peer, "connection accepted");

        let task = ConnectionTask {
            id,
            peer,
            stream,
            token,
            guard,
            timeouts: timeouts.clone(),
            idle_timeout: self.settings.idle_timeout(),
            handler: Arc::clone(&self.handler),
        };
        if let Err(error) = self.dispatch.spawn(Box::pin(task.run())) {
            tracing::warn!(connection = %id, peer = %peer, %error, "connection dispatch rejected");
        }
    }

    /// Repeat "close all, wait, re-check" until the registry empties.
    /// Closing is asynchronous (each task drops its own socket), so a
    /// single pass would race with organic closes.
    async fn drain(&self) {
        loop {
            let entries = self.registry.snapshot();
            if entries.is_empty() {
                break;
            }
            tracing::debug!(remaining = entries.len(), "draining connections");
            for entry in &entries {
                entry.close();
            }
            let _ = tokio::time::timeout(DRAIN_RECHECK, self.registry.changed()).await;
        }
    }
}
