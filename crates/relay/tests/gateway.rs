//! End-to-end tests over real TCP, with in-process worker tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use relay::{
    GatewayConfig, LaunchError, RelayClient, TaskLauncher, TransformCode, WorkerLauncher,
    WorkerLease, serve_listener,
};

struct TestGateway {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), relay::GatewayError>>,
}

impl TestGateway {
    async fn start(config: GatewayConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(serve_listener(listener, config, launcher, shutdown_rx));
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    async fn with_tasks() -> Self {
        Self::start(GatewayConfig::default(), Arc::new(TaskLauncher::new(100))).await
    }

    async fn client(&self) -> RelayClient {
        RelayClient::connect(self.addr).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("gateway did not shut down")
            .unwrap()
            .unwrap();
    }
}

/// Fails every launch for one kind, delegates the rest.
struct BrokenKind {
    broken: TransformCode,
    inner: TaskLauncher,
}

#[async_trait]
impl WorkerLauncher for BrokenKind {
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError> {
        if code == self.broken {
            return Err(LaunchError::Exited { code });
        }
        self.inner.launch(code).await
    }
}

/// Points one kind at a socket that never answers.
struct SilentKind {
    silent: TransformCode,
    sink: UdpSocket,
    inner: TaskLauncher,
}

#[async_trait]
impl WorkerLauncher for SilentKind {
    async fn launch(&self, code: TransformCode) -> Result<WorkerLease, LaunchError> {
        if code == self.silent {
            let addr = self
                .sink
                .local_addr()
                .map_err(|source| LaunchError::Bind { code, source })?;
            return Ok(WorkerLease::shared(code, addr));
        }
        self.inner.launch(code).await
    }
}

#[tokio::test]
async fn reverse_then_upper() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.set_sentence("Hello").await.unwrap();
    assert_eq!(client.transform("26").await.unwrap(), "OLLEH");

    client.close().await.unwrap();
    gateway.stop().await;
}

#[tokio::test]
async fn reply_is_text_plus_newline() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.set_sentence("abc XYZ").await.unwrap();
    let raw = client.transform_raw("5").await.unwrap();
    assert_eq!(raw.as_bytes(), b"nop KLM\n");

    gateway.stop().await;
}

#[tokio::test]
async fn unrecognized_code_ends_pipeline() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.set_sentence("Mixed Case").await.unwrap();
    let with_garbage = client.transform("1z9").await.unwrap();
    client.set_sentence("Mixed Case").await.unwrap();
    let plain = client.transform("1").await.unwrap();
    assert_eq!(with_garbage, plain);
    assert_eq!(plain, "Mixed Case");

    gateway.stop().await;
}

#[tokio::test]
async fn set_sentence_replaces_previous() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.set_sentence("foo").await.unwrap();
    client.set_sentence("bar").await.unwrap();
    assert_eq!(client.transform("3").await.unwrap(), "BAR");

    gateway.stop().await;
}

#[tokio::test]
async fn runs_chain_on_previous_result() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.set_sentence("Hello").await.unwrap();
    assert_eq!(client.transform("2").await.unwrap(), "olleH");
    assert_eq!(client.transform("3").await.unwrap(), "OLLEH");
    assert_eq!(client.transform("4").await.unwrap(), "olleh");

    gateway.stop().await;
}

#[tokio::test]
async fn runs_restart_from_sentence_without_chaining() {
    let gateway = TestGateway::start(
        GatewayConfig::default().with_chain_results(false),
        Arc::new(TaskLauncher::new(100)),
    )
    .await;
    let mut client = gateway.client().await;

    client.set_sentence("Hello").await.unwrap();
    assert_eq!(client.transform("2").await.unwrap(), "olleH");
    assert_eq!(client.transform("3").await.unwrap(), "HELLO");
    client.transform("2").await.unwrap();
    // No recognized codes: same starting text as any other run.
    assert_eq!(client.transform("z").await.unwrap(), "Hello");

    gateway.stop().await;
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let gateway = TestGateway::with_tasks().await;

    let mut tasks = Vec::new();
    for (sentence, codes, expected) in [
        ("alpha", "3", "ALPHA"),
        ("Bravo", "2", "ovarB"),
        ("charlie", "5", "puneyvr"),
        ("DELTA", "4", "delta"),
    ] {
        let mut client = gateway.client().await;
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                client.set_sentence(sentence).await.unwrap();
                assert_eq!(client.transform(codes).await.unwrap(), expected);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    gateway.stop().await;
}

#[tokio::test]
async fn launch_failure_returns_unmodified_text() {
    let launcher = BrokenKind {
        broken: TransformCode::Upper,
        inner: TaskLauncher::new(100),
    };
    let gateway = TestGateway::start(GatewayConfig::default(), Arc::new(launcher)).await;
    let mut client = gateway.client().await;

    client.set_sentence("steady").await.unwrap();
    assert_eq!(client.transform("3").await.unwrap(), "steady");
    // Steps before the failure still count.
    assert_eq!(client.transform("23").await.unwrap(), "ydaets");

    gateway.stop().await;
}

#[tokio::test]
async fn reply_timeout_gives_partial_result_and_session_survives() {
    let launcher = SilentKind {
        silent: TransformCode::Caesar,
        sink: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        inner: TaskLauncher::new(100),
    };
    let config = GatewayConfig::default().with_reply_timeout(Duration::from_millis(100));
    let gateway = TestGateway::start(config, Arc::new(launcher)).await;
    let mut client = gateway.client().await;

    client.set_sentence("abc").await.unwrap();
    assert_eq!(client.transform("354").await.unwrap(), "ABC");
    assert_eq!(client.transform("4").await.unwrap(), "abc");

    gateway.stop().await;
}

#[tokio::test]
async fn unknown_selector_closes_connection() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;

    client.send_selector("x").await.unwrap();
    assert!(client.transform_raw("1").await.is_err());

    gateway.stop().await;
}

#[tokio::test]
async fn oversized_sentence_is_truncated() {
    let gateway = TestGateway::start(
        GatewayConfig::default().with_max_message_size(5),
        Arc::new(TaskLauncher::new(5)),
    )
    .await;
    let mut client = gateway.client().await;

    client.set_sentence("truncate me").await.unwrap();
    assert_eq!(client.transform("3").await.unwrap(), "TRUNC");

    gateway.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let gateway = TestGateway::with_tasks().await;
    let mut client = gateway.client().await;
    // One round trip so the session is definitely running.
    client.set_sentence("bye").await.unwrap();
    assert_eq!(client.transform("1").await.unwrap(), "bye");

    gateway.stop().await;
    client.close().await.unwrap();
}
