//! In-memory transport factory for connection tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_framed_rpc::*;

/// Dials a fresh duplex pipe per connect; the far end serves `svc`.
pub struct MemoryConnectionTransport {
    stage: TransportStage,
    remotes: Mutex<Vec<Transport>>,
    /// Every local transport handed out by a dial.
    pub dialed: Mutex<Vec<Transport>>,
    /// While set, every dial fails.
    pub down: AtomicBool,
    /// Number of successful dials.
    pub dials: AtomicU32,
    /// Remaining `svc.flaky` calls that fail with `throttled`.
    pub throttles: Arc<AtomicU32>,
}

impl MemoryConnectionTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stage: TransportStage::new(),
            remotes: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
            dials: AtomicU32::new(0),
            throttles: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Close the far end of every pipe dialed so far.
    pub async fn sever(&self) {
        let remotes: Vec<_> = self.remotes.lock().drain(..).collect();
        for remote in remotes {
            remote.close().await;
        }
    }

    fn protocol(&self) -> Protocol {
        let throttles = self.throttles.clone();
        Protocol::new("svc")
            .method(
                "inc",
                MethodDescriptor::call(|_ctx, n: i64| async move { Ok::<_, RemoteError>(n + 1) }),
            )
            .method(
                "flaky",
                MethodDescriptor::call(move |_ctx, (): ()| {
                    let throttled = throttles
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    async move {
                        if throttled {
                            Err(RemoteError("throttled".to_string()))
                        } else {
                            Ok("done".to_string())
                        }
                    }
                }),
            )
            .method(
                "broken",
                MethodDescriptor::call(|_ctx, (): ()| async move {
                    Err::<(), _>(RemoteError("broken".to_string()))
                }),
            )
    }
}

#[async_trait]
impl ConnectionTransport for MemoryConnectionTransport {
    async fn dial(&self, ctx: &CancellationToken) -> Result<Transport> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Dial("peer is down".to_string()));
        }

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let remote = Transport::new(remote, TransportConfig::default());
        Server::new(remote.clone()).register(self.protocol())?;
        remote.run_async()?;
        self.remotes.lock().push(remote);

        let local = Transport::new(local, TransportConfig::default());
        self.stage.stage(local.clone());
        self.dialed.lock().push(local.clone());
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(local)
    }

    fn is_connected(&self) -> bool {
        self.stage.is_connected()
    }

    fn finalize(&self) {
        self.stage.finalize();
    }

    fn close(&self) {
        self.stage.close();
    }
}

/// Records every hook invocation.
#[derive(Default)]
pub struct RecordingHandler {
    pub retry_throttled: bool,
    pub fatal_connect_errors: bool,
    pub reject_connect: bool,
    pub command_waits: Mutex<Vec<Duration>>,
    pub connect_waits: Mutex<Vec<Duration>>,
    pub statuses: Mutex<Vec<DisconnectStatus>>,
    pub connects: AtomicU32,
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn on_connect(&self, client: &Client, _server: &Server) -> Result<()> {
        // The read loop is already running, so the peer is callable here.
        let echoed: i64 = client.call(&CancellationToken::new(), "svc.inc", &0).await?;
        assert_eq!(echoed, 1);
        if self.reject_connect {
            return Err(Error::Dial("rejected by handler".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_connect_error(&self, _err: &Error, wait: Duration) {
        self.connect_waits.lock().push(wait);
    }

    fn on_do_command_error(&self, _err: &Error, wait: Duration) {
        self.command_waits.lock().push(wait);
    }

    async fn on_disconnected(&self, status: DisconnectStatus) {
        self.statuses.lock().push(status);
    }

    fn should_retry(&self, _name: &str, err: &Error) -> bool {
        self.retry_throttled && err.to_string() == "throttled"
    }

    fn should_retry_on_connect(&self, _err: &Error) -> bool {
        !self.fatal_connect_errors
    }

    fn handler_name(&self) -> &str {
        "recording"
    }
}

/// Exact, fast backoff for tests.
pub fn fast_backoff(initial_ms: u64) -> ExponentialBackoffPolicy {
    ExponentialBackoffPolicy::default()
        .with_initial_interval(Duration::from_millis(initial_ms))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(Duration::from_millis(initial_ms * 8))
}

pub fn options() -> ConnectionOptions {
    let _ = tracing_subscriber::fmt::try_init();
    ConnectionOptions::default()
        .with_reconnect_backoff(fast_backoff(5))
        .with_command_backoff(fast_backoff(10))
}

/// Wait until `condition` holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}
