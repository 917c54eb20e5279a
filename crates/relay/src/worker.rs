//! Transform worker - the UDP side of a pipeline step.
//!
//! The launcher side (spawning, readiness) is in launcher.rs.
//!
//! Lifecycle of a one-shot worker:
//! 1. Bind the UDP socket
//! 2. Announce `Ready` on stdout (process workers only)
//! 3. Wait for one datagram, transform it, reply to the sender
//! 4. Exit
//!
//! Pooled workers skip step 4 and keep serving.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::stdout;
use tokio::net::UdpSocket;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::WorkerEvent;
use crate::transform::TransformCode;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not bind {code} worker to {addr}: {source}")]
    Bind {
        code: TransformCode,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no request arrived within {0:?}")]
    IdleTimeout(Duration),

    #[error("failed to announce readiness: {0}")]
    Announce(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct WorkerConfig {
    pub code: TransformCode,
    pub bind: SocketAddr,
    pub max_message_size: usize,
    /// One-shot workers give up after this long without a request.
    pub idle_timeout: Option<Duration>,
    /// Keep serving after the first request (pooled mode).
    pub serve_forever: bool,
}

impl WorkerConfig {
    pub fn new(code: TransformCode, bind: SocketAddr) -> Self {
        Self {
            code,
            bind,
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: None,
            serve_forever: false,
        }
    }
}

/// Receive one datagram on `socket`, apply `code` and reply to its sender.
///
/// Returns the number of bytes sent back.
pub async fn serve_once(
    code: TransformCode,
    socket: &UdpSocket,
    max_message_size: usize,
    idle_timeout: Option<Duration>,
) -> Result<usize, WorkerError> {
    let mut buf = vec![0u8; max_message_size.max(1)];

    let received = socket.recv_from(&mut buf);
    let (n, peer) = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, received)
            .await
            .map_err(|_| WorkerError::IdleTimeout(limit))??,
        None => received.await?,
    };
    tracing::debug!(%code, bytes = n, %peer, "Worker received request");

    let mut reply = code.apply(&buf[..n.min(max_message_size)]);
    reply.truncate(max_message_size);
    socket.send_to(&reply, peer).await?;

    tracing::debug!(%code, bytes = reply.len(), %peer, "Worker sent reply");
    Ok(reply.len())
}

/// Serve requests until the task is aborted. Per-request errors are logged
/// and the worker keeps going.
pub async fn serve_forever(code: TransformCode, socket: UdpSocket, max_message_size: usize) {
    loop {
        if let Err(e) = serve_once(code, &socket, max_message_size, None).await {
            tracing::warn!(%code, error = %e, "Pooled worker request failed");
        }
    }
}

/// Entry point of the `relay-worker` binary.
///
/// Readiness goes to stdout as a [`WorkerEvent`] frame; logs go to stderr.
pub async fn run_worker(config: WorkerConfig) -> Result<(), WorkerError> {
    let code = config.code;
    let mut events = FramedWrite::new(stdout(), JsonCodec::<WorkerEvent>::new());

    let socket = match UdpSocket::bind(config.bind).await {
        Ok(socket) => socket,
        Err(source) => {
            let err = WorkerError::Bind {
                code,
                addr: config.bind,
                source,
            };
            let _ = events
                .send(WorkerEvent::Failed {
                    error: err.to_string(),
                })
                .await;
            return Err(err);
        }
    };
    let addr = socket.local_addr()?;

    events
        .send(WorkerEvent::Ready { kind: code, addr })
        .await
        .map_err(WorkerError::Announce)?;
    tracing::info!(%code, %addr, "Worker listening");

    if config.serve_forever {
        serve_forever(code, socket, config.max_message_size).await;
        return Ok(());
    }

    serve_once(code, &socket, config.max_message_size, config.idle_timeout).await?;
    tracing::info!(%code, "Worker exiting");
    Ok(())
}
