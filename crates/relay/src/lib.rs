//! relay: TCP gateway that pipes sentences through one-shot UDP transform workers.

pub mod bridge;
pub mod client;
pub mod config;
pub mod gateway;
pub mod launcher;
pub mod logging;
pub mod pipeline;
pub mod session;
pub mod transform;
pub mod worker;

pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::protocol::{Command, Message, WorkerEvent};
pub use client::{ClientError, RelayClient};
pub use config::{ConfigError, GatewayConfig, LauncherKind, WorkerEndpoints};
pub use gateway::{GatewayError, SessionState, serve, serve_listener, shutdown_signal};
pub use launcher::{
    LaunchError, PooledLauncher, ProcessLauncher, TaskLauncher, WorkerLauncher, WorkerLease,
    build_launcher,
};
pub use pipeline::{
    Dispatcher, ExchangeError, Pipeline, PipelineOutcome, PipelineStatus, StepError,
};
pub use session::{Session, SessionId};
pub use transform::{TransformCode, UnknownTransform};
pub use worker::{WorkerConfig, WorkerError, run_worker};
