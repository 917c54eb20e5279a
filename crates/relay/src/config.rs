//! Gateway and worker configuration.
//!
//! Defaults match the classic deployment: clients on TCP 8080, one worker port
//! per transform starting at UDP 8081, 100-byte messages. Everything can be
//! overridden from the environment (`RELAY_*`) or by the binaries' flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::transform::TransformCode;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKER_BASE_PORT: u16 = 8081;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100;

/// File name of the worker binary, looked up next to the gateway executable.
pub fn worker_bin_name() -> String {
    format!("relay-worker{}", std::env::consts::EXE_SUFFIX)
}

fn default_worker_program() -> PathBuf {
    let name = worker_bin_name();
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(&name))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Well-known UDP address of each worker kind. Read-only after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEndpoints {
    addrs: [SocketAddr; 6],
}

impl WorkerEndpoints {
    /// Kind *i* (in [`TransformCode::ALL`] order) listens on `base_port + i`.
    ///
    /// A base port of 0 gives every kind an OS-assigned port.
    pub fn from_base(host: IpAddr, base_port: u16) -> Self {
        let addrs = TransformCode::ALL.map(|code| {
            let port = if base_port == 0 {
                0
            } else {
                base_port.saturating_add(code.index() as u16)
            };
            SocketAddr::new(host, port)
        });
        Self { addrs }
    }

    /// Every kind on an OS-assigned loopback port.
    pub fn ephemeral() -> Self {
        Self::from_base(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    pub fn addr(&self, code: TransformCode) -> SocketAddr {
        self.addrs[code.index()]
    }

    pub fn with_addr(mut self, code: TransformCode, addr: SocketAddr) -> Self {
        self.addrs[code.index()] = addr;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (TransformCode, SocketAddr)> + '_ {
        TransformCode::ALL.into_iter().map(|code| (code, self.addr(code)))
    }
}

impl Default for WorkerEndpoints {
    fn default() -> Self {
        Self::from_base(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_WORKER_BASE_PORT)
    }
}

/// How pipeline steps reach a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LauncherKind {
    /// One `relay-worker` process per step.
    #[default]
    Process,
    /// One in-process worker task per step, on an ephemeral port.
    Task,
    /// Long-lived workers, one per kind, on the configured endpoints.
    Pooled,
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            "pooled" | "pool" => Ok(Self::Pooled),
            other => Err(format!(
                "unknown launcher '{other}', expected process, task or pooled"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub endpoints: WorkerEndpoints,
    /// Upper bound on sentences, code strings and worker datagrams.
    pub max_message_size: usize,
    /// How long a pipeline step waits for its worker's reply.
    pub reply_timeout: Duration,
    /// How long a spawned worker has to report that it is ready.
    pub startup_timeout: Duration,
    /// A one-shot worker that receives nothing within this window exits.
    pub worker_idle_timeout: Duration,
    /// Local address for the per-step reply socket.
    pub reply_bind: SocketAddr,
    pub worker_program: PathBuf,
    pub launcher: LauncherKind,
    /// Start each run from the previous result instead of the last sentence.
    pub chain_results: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            endpoints: WorkerEndpoints::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reply_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(5),
            worker_idle_timeout: Duration::from_secs(30),
            reply_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            worker_program: default_worker_program(),
            launcher: LauncherKind::default(),
            chain_results: true,
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(host) = lookup("RELAY_HOST") {
            self.host = host;
        }
        if let Some(v) = lookup("RELAY_PORT") {
            self.port = parse("RELAY_PORT", &v)?;
        }

        let worker_host = lookup("RELAY_WORKER_HOST")
            .map(|v| parse::<IpAddr>("RELAY_WORKER_HOST", &v))
            .transpose()?;
        let worker_base = lookup("RELAY_WORKER_BASE_PORT")
            .map(|v| parse::<u16>("RELAY_WORKER_BASE_PORT", &v))
            .transpose()?;
        if worker_host.is_some() || worker_base.is_some() {
            let current = self.endpoints.addr(TransformCode::Identity);
            self.endpoints = WorkerEndpoints::from_base(
                worker_host.unwrap_or(current.ip()),
                worker_base.unwrap_or(current.port()),
            );
        }

        if let Some(v) = lookup("RELAY_MAX_MESSAGE") {
            let size: usize = parse("RELAY_MAX_MESSAGE", &v)?;
            if size == 0 {
                return Err(ConfigError::invalid("RELAY_MAX_MESSAGE", &v, "must be positive"));
            }
            self.max_message_size = size;
        }
        if let Some(v) = lookup("RELAY_REPLY_TIMEOUT_MS") {
            self.reply_timeout = Duration::from_millis(parse("RELAY_REPLY_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("RELAY_STARTUP_TIMEOUT_MS") {
            self.startup_timeout = Duration::from_millis(parse("RELAY_STARTUP_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("RELAY_WORKER_IDLE_TIMEOUT_MS") {
            self.worker_idle_timeout =
                Duration::from_millis(parse("RELAY_WORKER_IDLE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("RELAY_WORKER_BIN") {
            self.worker_program = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELAY_LAUNCHER") {
            self.launcher = v
                .parse::<LauncherKind>()
                .map_err(|reason: String| ConfigError::invalid("RELAY_LAUNCHER", &v, reason))?;
        }
        if let Some(v) = lookup("RELAY_CHAIN_RESULTS") {
            self.chain_results = parse_bool("RELAY_CHAIN_RESULTS", &v)?;
        }
        Ok(self)
    }

    /// `host` is an IP literal; IPv6 may be given bare (`::`) or bracketed.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim();
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = parse("host", literal)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_endpoints(mut self, endpoints: WorkerEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherKind) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_chain_results(mut self, chain: bool) -> Self {
        self.chain_results = chain;
        self
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_classic_ports() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_message_size, 100);
        assert_eq!(config.endpoints.addr(TransformCode::Identity).port(), 8081);
        assert_eq!(config.endpoints.addr(TransformCode::Custom).port(), 8086);
        assert_eq!(config.launcher, LauncherKind::Process);
        assert!(config.chain_results);
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn env_overrides_defaults() {
        let config = GatewayConfig::default()
            .apply_env(env(&[
                ("RELAY_PORT", "9000"),
                ("RELAY_WORKER_BASE_PORT", "9100"),
                ("RELAY_MAX_MESSAGE", "256"),
                ("RELAY_REPLY_TIMEOUT_MS", "250"),
                ("RELAY_LAUNCHER", "pooled"),
                ("RELAY_CHAIN_RESULTS", "off"),
                ("RELAY_WORKER_BIN", "/opt/relay/relay-worker"),
            ]))
            .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.endpoints.addr(TransformCode::Caesar).port(), 9104);
        assert_eq!(
            config.endpoints.addr(TransformCode::Caesar).ip(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(config.max_message_size, 256);
        assert_eq!(config.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.launcher, LauncherKind::Pooled);
        assert!(!config.chain_results);
        assert_eq!(config.worker_program, PathBuf::from("/opt/relay/relay-worker"));
    }

    #[test]
    fn worker_host_keeps_base_port() {
        let config = GatewayConfig::default()
            .apply_env(env(&[("RELAY_WORKER_HOST", "10.0.0.7")]))
            .unwrap();
        let addr = config.endpoints.addr(TransformCode::Reverse);
        assert_eq!(addr, "10.0.0.7:8082".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn invalid_env_values_are_reported() {
        let err = GatewayConfig::default()
            .apply_env(env(&[("RELAY_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("RELAY_PORT"));

        assert!(
            GatewayConfig::default()
                .apply_env(env(&[("RELAY_MAX_MESSAGE", "0")]))
                .is_err()
        );
        assert!(
            GatewayConfig::default()
                .apply_env(env(&[("RELAY_LAUNCHER", "threads")]))
                .is_err()
        );
        assert!(
            GatewayConfig::default()
                .apply_env(env(&[("RELAY_CHAIN_RESULTS", "maybe")]))
                .is_err()
        );
    }

    #[test]
    fn listen_addr_accepts_ipv6_hosts() {
        let any6 = GatewayConfig::default()
            .apply_env(env(&[("RELAY_HOST", "::")]))
            .unwrap();
        assert_eq!(
            any6.listen_addr().unwrap(),
            "[::]:8080".parse::<SocketAddr>().unwrap()
        );

        let bracketed = GatewayConfig::default().with_host("[::1]").with_port(9000);
        assert_eq!(
            bracketed.listen_addr().unwrap(),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );

        let v4 = GatewayConfig::default().with_host("127.0.0.1").with_port(0);
        assert_eq!(
            v4.listen_addr().unwrap(),
            "127.0.0.1:0".parse::<SocketAddr>().unwrap()
        );

        assert!(GatewayConfig::default().with_host("not a host").listen_addr().is_err());
    }

    #[test]
    fn ephemeral_endpoints_use_port_zero() {
        let endpoints = WorkerEndpoints::ephemeral();
        assert!(endpoints.iter().all(|(_, addr)| addr.port() == 0));
    }

    #[test]
    fn with_addr_overrides_one_kind() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let endpoints = WorkerEndpoints::default().with_addr(TransformCode::Upper, addr);
        assert_eq!(endpoints.addr(TransformCode::Upper), addr);
        assert_eq!(endpoints.addr(TransformCode::Lower).port(), 8084);
    }
}
