//! Worker launchers - make a worker ready for one pipeline step.
//!
//! Flow for the process launcher:
//! 1. Take the kind's port lease (fixed ports are shared process-wide)
//! 2. Spawn `relay-worker <kind> --bind <addr>`
//! 3. Wait, bounded by the startup timeout, for its `Ready` frame on stdout
//! 4. Hand the address back inside a [`WorkerLease`]
//!
//! Dropping the lease kills a worker that is still running and releases the
//! port, so an abandoned step never leaves a worker behind.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::WorkerEvent;
use crate::config::{GatewayConfig, LauncherKind, WorkerEndpoints};
use crate::transform::TransformCode;
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {code} worker: {source}")]
    Spawn {
        code: TransformCode,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind {code} worker: {source}")]
    Bind {
        code: TransformCode,
        #[source]
        source: std::io::Error,
    },
    #[error("{code} worker did not report ready within {timeout:?}")]
    StartupTimeout {
        code: TransformCode,
        timeout: Duration,
    },
    #[error("{code} worker exited before reporting ready")]
    Exited { code: TransformCode },
    #[error("{code} worker failed to start: {error}")]
    Failed { code: TransformCode, error: String },
    #[error("readiness protocol error: {0}")]
    Protocol(String),
    #[error("no pooled worker for {code}")]
    NotPooled { code: TransformCode },
}

/// Extension point for how pipeline steps reach a worker.
///
/// The dispatcher only sees leases, so one-shot processes, in-process tasks
/// and a long-lived pool are interchangeable.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Make a worker for `code` ready to receive one request.
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError>;
}

/// A worker that is ready for one request. Release by dropping.
#[derive(Debug)]
pub struct WorkerLease {
    code: TransformCode,
    addr: SocketAddr,
    holder: LeaseHolder,
}

#[derive(Debug)]
enum LeaseHolder {
    Process {
        child: Option<Child>,
        port: Option<OwnedMutexGuard<()>>,
    },
    Task(JoinHandle<()>),
    Shared,
}

impl WorkerLease {
    /// Lease for a worker whose lifetime is managed elsewhere.
    pub fn shared(code: TransformCode, addr: SocketAddr) -> Self {
        Self {
            code,
            addr,
            holder: LeaseHolder::Shared,
        }
    }

    /// Lease that aborts `task` when dropped.
    pub fn task(code: TransformCode, addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self {
            code,
            addr,
            holder: LeaseHolder::Task(task),
        }
    }

    fn process(
        code: TransformCode,
        addr: SocketAddr,
        child: Child,
        port: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            code,
            addr,
            holder: LeaseHolder::Process {
                child: Some(child),
                port,
            },
        }
    }

    pub fn code(&self) -> TransformCode {
        self.code
    }

    /// Where to send the request datagram.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        match &mut self.holder {
            LeaseHolder::Task(handle) => handle.abort(),
            LeaseHolder::Process { child, port } => {
                // The port is released only after the child is reaped, so the
                // next worker of this kind can bind it. Without a runtime,
                // kill_on_drop still stops the child.
                let Ok(runtime) = Handle::try_current() else {
                    return;
                };
                if let Some(mut child) = child.take() {
                    let port = port.take();
                    let code = self.code;
                    runtime.spawn(async move {
                        if let Err(e) = child.kill().await {
                            tracing::debug!(%code, error = %e, "Worker already gone");
                        }
                        drop(port);
                    });
                }
            }
            LeaseHolder::Shared => {}
        }
    }
}

/// A worker bound to `0.0.0.0` or `::` is reached over loopback.
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Spawns one `relay-worker` process per step on the kind's well-known port.
pub struct ProcessLauncher {
    program: PathBuf,
    endpoints: WorkerEndpoints,
    max_message_size: usize,
    startup_timeout: Duration,
    idle_timeout: Duration,
    port_leases: [Arc<Mutex<()>>; 6],
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, endpoints: WorkerEndpoints) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            program: program.into(),
            endpoints,
            max_message_size: defaults.max_message_size,
            startup_timeout: defaults.startup_timeout,
            idle_timeout: defaults.worker_idle_timeout,
            port_leases: std::array::from_fn(|_| Arc::new(Mutex::new(()))),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.worker_program.clone(), config.endpoints)
            .with_max_message_size(config.max_message_size)
            .with_startup_timeout(config.startup_timeout)
            .with_idle_timeout(config.worker_idle_timeout)
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn command(&self, code: TransformCode, bind: SocketAddr) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(code.name())
            .arg("--bind")
            .arg(bind.to_string())
            .arg("--max-message")
            .arg(self.max_message_size.to_string())
            .arg("--idle-timeout-ms")
            .arg(self.idle_timeout.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError> {
        let bind = self.endpoints.addr(code);

        // Port 0 means every worker gets its own port, so nothing to serialize.
        let port = if bind.port() == 0 {
            None
        } else {
            Some(Arc::clone(&self.port_leases[code.index()]).lock_owned().await)
        };

        tracing::debug!(%code, %bind, program = %self.program.display(), "Spawning worker");
        let mut child = self
            .command(code, bind)
            .spawn()
            .map_err(|source| LaunchError::Spawn { code, source })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Protocol("worker stdout not captured".to_string()))?;
        let mut events = FramedRead::new(stdout, JsonCodec::<WorkerEvent>::new());

        let ready = tokio::time::timeout(self.startup_timeout, async {
            match events.next().await {
                Some(Ok(WorkerEvent::Ready { kind, addr })) => {
                    if kind != code {
                        tracing::warn!(%code, reported = %kind, "Worker reported a different kind");
                    }
                    Ok(addr)
                }
                Some(Ok(WorkerEvent::Failed { error })) => Err(LaunchError::Failed { code, error }),
                Some(Err(e)) => Err(LaunchError::Protocol(format!(
                    "readiness channel error: {}",
                    e
                ))),
                None => Err(LaunchError::Exited { code }),
            }
        })
        .await;

        let bound = match ready {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(LaunchError::StartupTimeout {
                    code,
                    timeout: self.startup_timeout,
                });
            }
        };

        let addr = dialable(bound);
        tracing::debug!(%code, %addr, pid = child.id(), "Worker ready");
        Ok(WorkerLease::process(code, addr, child, port))
    }
}

/// Starts a one-shot worker task per step on an ephemeral port.
pub struct TaskLauncher {
    host: IpAddr,
    max_message_size: usize,
    idle_timeout: Option<Duration>,
}

impl TaskLauncher {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_message_size,
            idle_timeout: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.max_message_size).with_idle_timeout(config.worker_idle_timeout)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError> {
        // Bound before we return, so the worker is ready by construction.
        let socket = UdpSocket::bind(SocketAddr::new(self.host, 0))
            .await
            .map_err(|source| LaunchError::Bind { code, source })?;
        let addr = socket
            .local_addr()
            .map_err(|source| LaunchError::Bind { code, source })?;

        let max = self.max_message_size;
        let idle = self.idle_timeout;
        let handle = tokio::spawn(async move {
            if let Err(e) = worker::serve_once(code, &socket, max, idle).await {
                tracing::warn!(%code, error = %e, "Worker task failed");
            }
        });

        tracing::trace!(%code, %addr, "Worker task ready");
        Ok(WorkerLease::task(code, addr, handle))
    }
}

/// Long-lived workers, one per kind, started once and shared by all sessions.
pub struct PooledLauncher {
    workers: HashMap<TransformCode, (SocketAddr, JoinHandle<()>)>,
}

impl PooledLauncher {
    /// Bind every endpoint and start its worker.
    pub async fn start(
        endpoints: &WorkerEndpoints,
        max_message_size: usize,
    ) -> Result<Self, LaunchError> {
        let mut workers = HashMap::with_capacity(TransformCode::ALL.len());
        for (code, bind) in endpoints.iter() {
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|source| LaunchError::Bind { code, source })?;
            let addr = socket
                .local_addr()
                .map(dialable)
                .map_err(|source| LaunchError::Bind { code, source })?;
            let handle = tokio::spawn(worker::serve_forever(code, socket, max_message_size));
            tracing::info!(%code, %addr, "Pooled worker started");
            workers.insert(code, (addr, handle));
        }
        Ok(Self { workers })
    }

    pub fn addr(&self, code: TransformCode) -> Option<SocketAddr> {
        self.workers.get(&code).map(|(addr, _)| *addr)
    }
}

impl Drop for PooledLauncher {
    fn drop(&mut self) {
        for (_, handle) in self.workers.values() {
            handle.abort();
        }
    }
}

#[async_trait]
impl WorkerLauncher for PooledLauncher {
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError> {
        self.addr(code)
            .map(|addr| WorkerLease::shared(code, addr))
            .ok_or(LaunchError::NotPooled { code })
    }
}

/// Build the launcher selected by `config.launcher`.
pub async fn build_launcher(
    config: &GatewayConfig,
) -> Result<Arc<dyn WorkerLauncher>, LaunchError> {
    let launcher: Arc<dyn WorkerLauncher> = match config.launcher {
        LauncherKind::Process => Arc::new(ProcessLauncher::from_config(config)),
        LauncherKind::Task => Arc::new(TaskLauncher::from_config(config)),
        LauncherKind::Pooled => {
            Arc::new(PooledLauncher::start(&config.endpoints, config.max_message_size).await?)
        }
    };
    tracing::info!(launcher = ?config.launcher, "Worker launcher ready");
    Ok(launcher)
}
