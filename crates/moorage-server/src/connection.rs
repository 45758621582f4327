//! Per-connection task.
//!
//! Runs the external handler against the connection's streams under an
//! idle timeout, and guarantees that on every exit path the timeout entry
//! is cancelled, the transport is closed, and the registry entry is
//! removed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::handler::ConnectionHandler;
use crate::registry::{ConnectionId, RegistryGuard};
use crate::timeout::TimeoutQueue;

/// One accepted connection's unit of work.
pub(crate) struct ConnectionTask {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    pub(crate) stream: TcpStream,
    pub(crate) token: CancellationToken,
    pub(crate) guard: RegistryGuard,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) idle_timeout: Duration,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
}

impl ConnectionTask {
    pub(crate) async fn run(self) {
        // A queue that is already torn down means the server is stopping;
        // treat the connection as timed out on arrival.
        let timeout_key = match self.timeouts.register(self.idle_timeout, self.token.clone()) {
            Ok(key) => Some(key),
            Err(_) => {
                self.token.cancel();
                None
            }
        };

        let (input, output) = self.stream.into_split();

        // The handler future owns both stream halves. Racing it against the
        // token mirrors cancellation-at-suspension-points: an ignoring
        // handler is still torn down at its next await. Low-level I/O
        // errors end this task and nothing else.
        tokio::select! {
            result = self.handler.handle(input, output, self.token.clone()) => match result {
                Ok(()) => {
                    tracing::debug!(connection = %self.id, peer = %self.peer, "handler finished");
                }
                Err(error) => {
                    tracing::debug!(
                        connection = %self.id,
                        peer = %self.peer,
                        %error,
                        "handler ended with I/O error"
                    );
                }
            },
            () = self.token.cancelled() => {
                tracing::debug!(connection = %self.id, peer = %self.peer, "connection cancelled");
            }
        }

        // Unconditional teardown, in order: cancel the idle timer, close the
        // transport (the raced handler future and its stream halves are
        // already dropped here), deregister. Straight-line code after the
        // race, so a late cancellation cannot interrupt it.
        if let Some(key) = timeout_key {
            self.timeouts.cancel(key);
        }
        drop(self.guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionEntry, ConnectionRegistry};
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn task_for(
        stream: TcpStream,
        registry: &ConnectionRegistry,
        timeouts: &TimeoutQueue,
        idle_timeout: Duration,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (ConnectionTask, CancellationToken) {
        let id = ConnectionId::next();
        let peer = stream.peer_addr().unwrap();
        let token = CancellationToken::new();
        registry.add(ConnectionEntry::new(id, peer, token.clone()));
        let task = ConnectionTask {
            id,
            peer,
            stream,
            token: token.clone(),
            guard: RegistryGuard::new(registry.clone(), id),
            timeouts: timeouts.clone(),
            idle_timeout,
            handler,
        };
        (task, token)
    }

    #[tokio::test]
    async fn test_normal_exit_cleans_up() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        let (server, _client) = accepted_pair().await;

        async fn done(
            _input: OwnedReadHalf,
            _output: OwnedWriteHalf,
            _cancel: CancellationToken,
        ) -> io::Result<()> {
            Ok(())
        }

        let (task, _) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(done),
        );
        assert_eq!(registry.len(), 1);

        task.run().await;

        assert!(registry.is_empty());
        assert_eq!(timeouts.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_swallowed() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        let (server, _client) = accepted_pair().await;

        async fn broken(
            _input: OwnedReadHalf,
            _output: OwnedWriteHalf,
            _cancel: CancellationToken,
        ) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer gone"))
        }

        let (task, _) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(broken),
        );

        // Completes without panicking or escalating.
        task.run().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_closes_transport() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        let (server, mut client) = accepted_pair().await;

        async fn stall(
            mut input: OwnedReadHalf,
            _output: OwnedWriteHalf,
            _cancel: CancellationToken,
        ) -> io::Result<()> {
            let mut buf = [0u8; 1];
            loop {
                if input.read(&mut buf).await? == 0 {
                    return Ok(());
                }
            }
        }

        let (task, token) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(stall),
        );
        let running = tokio::spawn(task.run());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("task should end after cancellation")
            .unwrap();

        // The server side dropped its socket: the client observes EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("read should not hang")
            .expect("read should succeed with EOF");
        assert_eq!(n, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_means_timed_out_on_arrival() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        timeouts.close();
        let (server, _client) = accepted_pair().await;

        async fn stall(
            _input: OwnedReadHalf,
            _output: OwnedWriteHalf,
            cancel: CancellationToken,
        ) -> io::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        let (task, token) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(stall),
        );

        tokio::time::timeout(Duration::from_secs(1), task.run())
            .await
            .expect("task should end immediately");
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_unpolled_task_releases_entry_and_socket() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        let (server, mut client) = accepted_pair().await;

        async fn never(
            _input: OwnedReadHalf,
            _output: OwnedWriteHalf,
            _cancel: CancellationToken,
        ) -> io::Result<()> {
            std::future::pending().await
        }

        let (task, _) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(never),
        );
        assert_eq!(registry.len(), 1);

        // Simulates dispatch rejection: the future is dropped unpolled.
        drop(task.run());

        assert!(registry.is_empty());
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("read should not hang")
            .expect("read should succeed with EOF");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_pipelined_exchanges_on_one_connection() {
        let registry = ConnectionRegistry::new();
        let timeouts = TimeoutQueue::new();
        let (server, mut client) = accepted_pair().await;

        async fn echo(
            mut input: OwnedReadHalf,
            mut output: OwnedWriteHalf,
            _cancel: CancellationToken,
        ) -> io::Result<()> {
            let mut buf = [0u8; 64];
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                output.write_all(&buf[..n]).await?;
            }
        }

        let (task, _) = task_for(
            server,
            &registry,
            &timeouts,
            Duration::from_secs(45),
            Arc::new(echo),
        );
        let running = tokio::spawn(task.run());

        for round in 0..3u8 {
            let msg = [round; 4];
            client.write_all(&msg).await.unwrap();
            let mut reply = [0u8; 4];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, msg);
        }

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("task should end at EOF")
            .unwrap();
        assert!(registry.is_empty());
    }
}
