//! Pluggable transport factories for reconnecting connections.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportConfig};

/// Default TCP keep-alive for dialed connections.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Dials transports on behalf of a [`crate::Connection`].
///
/// A dial produces a *staged* transport; it only becomes the current one once
/// the connection calls [`ConnectionTransport::finalize`] after its handler
/// accepted it.
#[async_trait]
pub trait ConnectionTransport: Send + Sync + 'static {
    /// Establish a new transport and stage it. Replaces any earlier staged one.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot be reached, or
    /// [`Error::Canceled`] if `ctx` fires first.
    async fn dial(&self, ctx: &CancellationToken) -> Result<Transport>;

    /// Whether the finalized transport is up.
    fn is_connected(&self) -> bool;

    /// Promote the staged transport to current, closing the previous one.
    fn finalize(&self);

    /// Close the current and staged transports.
    fn close(&self);
}

/// Staged and current transport bookkeeping shared by factory implementations.
#[derive(Default)]
pub struct TransportStage {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    current: Option<Transport>,
    staged: Option<Transport>,
}

impl TransportStage {
    /// Create an empty stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a freshly dialed transport, stopping any earlier staged one.
    pub fn stage(&self, transport: Transport) {
        let previous = self.slots.lock().staged.replace(transport);
        if let Some(previous) = previous {
            debug!("Discarding previously staged transport");
            previous.stop();
        }
    }

    /// Whether the current transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slots
            .lock()
            .current
            .as_ref()
            .is_some_and(Transport::is_connected)
    }

    /// Promote the staged transport, stopping the old current one.
    pub fn finalize(&self) {
        let mut slots = self.slots.lock();
        if let Some(staged) = slots.staged.take() {
            if let Some(old) = slots.current.replace(staged) {
                old.stop();
            }
        }
    }

    /// Stop both transports.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        for transport in [slots.current.take(), slots.staged.take()].into_iter().flatten() {
            transport.stop();
        }
    }
}

/// Connect to `address`, honouring `ctx` and an optional timeout.
///
/// # Errors
///
/// Returns the connect error, [`Error::Dial`] on timeout, or
/// [`Error::Canceled`] if `ctx` fires first.
pub async fn dial_tcp(
    ctx: &CancellationToken,
    address: &str,
    timeout: Option<Duration>,
    keep_alive: Option<Duration>,
) -> Result<TcpStream> {
    let connect = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(address))
                .await
                .map_err(|_| {
                    Error::Dial(format!("timed out connecting to {address} after {limit:?}"))
                })?
                .map_err(Error::from),
            None => TcpStream::connect(address).await.map_err(Error::from),
        }
    };

    let stream = tokio::select! {
        biased;
        () = ctx.cancelled() => return Err(Error::Canceled),
        stream = connect => stream?,
    };

    stream.set_nodelay(true)?;
    if let Some(interval) = keep_alive {
        SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
    }
    Ok(stream)
}

/// Plain TCP transport factory.
pub struct TcpConnectionTransport {
    address: String,
    keep_alive: Option<Duration>,
    dial_timeout: Option<Duration>,
    config: TransportConfig,
    stage: TransportStage,
}

impl TcpConnectionTransport {
    /// Dial `address` (`host:port`) with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            dial_timeout: None,
            config: TransportConfig::default(),
            stage: TransportStage::new(),
        }
    }

    /// Set the TCP keep-alive interval; `None` leaves the OS default.
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Bound how long a single dial may take.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the configuration for dialed transports.
    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl ConnectionTransport for TcpConnectionTransport {
    async fn dial(&self, ctx: &CancellationToken) -> Result<Transport> {
        debug!(address = %self.address, "Dialing");
        let stream = dial_tcp(ctx, &self.address, self.dial_timeout, self.keep_alive).await?;
        let transport = Transport::new(stream, self.config.clone());
        self.stage.stage(transport.clone());
        Ok(transport)
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
