//! Line-echo server demo.
//!
//! Run with `cargo run --example echo`, then `nc 127.0.0.1 7000`.
//! Connections idle for more than 30 seconds are closed by the server;
//! Ctrl-C drains everything and exits.

use std::io;
use std::time::Duration;

use moorage_server::{start, ServerSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn echo(
    mut input: OwnedReadHalf,
    mut output: OwnedWriteHalf,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            read = input.read(&mut buf) => read?,
            () = cancel.cancelled() => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        output.write_all(&buf[..n]).await?;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = ServerSettings::builder()
        .host("127.0.0.1")
        .port(7000)
        .idle_timeout(Duration::from_secs(30))
        .build();

    let mut server = start(settings, echo);
    let addr = server.bound_addr().await?;
    tracing::info!(%addr, "echo server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown_and_wait().await;
    Ok(())
}
