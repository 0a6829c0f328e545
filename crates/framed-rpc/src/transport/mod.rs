//! Transport layer: one stream, one read loop, a dispatcher and a receiver.
//!
//! A [`Transport`] moves through three states. It starts *not started*; the
//! first call to [`Transport::run`] or [`Transport::run_async`] spawns the
//! read loop and moves it to *running*; when the stream ends, fails, or a
//! local stop is requested it shuts down in order (read loop, receiver,
//! dispatcher, writer) and ends *stopped*.

pub mod dispatcher;
pub mod encoder;
pub mod packetizer;
pub mod receiver;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::framing::{FrameCodec, MAX_FRAME_SIZE};
use crate::registry::{ErrorWrapper, ProtocolRegistry, StringErrorWrapper};

pub use dispatcher::{Dispatcher, ResponsePayload};
pub use encoder::MessageEncoder;
pub use packetizer::Packetizer;
pub use receiver::{CloseReason, Receiver};

/// Configuration for a transport.
#[derive(Clone)]
pub struct TransportConfig {
    /// Largest frame body accepted or sent.
    pub max_frame_size: usize,
    /// Wire representation of errors sent in responses.
    pub error_wrapper: Arc<dyn ErrorWrapper>,
}

impl TransportConfig {
    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the error wrapper used for responses.
    #[must_use]
    pub fn with_error_wrapper(mut self, wrapper: Arc<dyn ErrorWrapper>) -> Self {
        self.error_wrapper = wrapper;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            error_wrapper: Arc::new(StringErrorWrapper),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

enum RunState {
    NotStarted(Packetizer),
    Running,
    Stopped,
}

struct TransportInner {
    state: Mutex<RunState>,
    encoder: Arc<MessageEncoder>,
    dispatcher: Dispatcher,
    receiver: Receiver,
    registry: ProtocolRegistry,
    stop: CancellationToken,
    stopped: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

/// A bidirectional RPC endpoint over one byte stream.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap a stream. Must be called within a Tokio runtime.
    pub fn new<S>(stream: S, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let (reader, writer) = tokio::io::split(stream);

        let encoder = Arc::new(MessageEncoder::new(Box::new(writer), codec));
        let registry = ProtocolRegistry::new(config.error_wrapper);
        let dispatcher = Dispatcher::new(encoder.clone());
        let receiver = Receiver::new(registry.clone(), dispatcher.clone(), encoder.clone());

        Self {
            inner: Arc::new(TransportInner {
                state: Mutex::new(RunState::NotStarted(Packetizer::new(Box::new(reader), codec))),
                encoder,
                dispatcher,
                receiver,
                registry,
                stop: CancellationToken::new(),
                stopped: CancellationToken::new(),
                close_reason: Mutex::new(None),
            }),
        }
    }

    /// Start the read loop in the background. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] if the transport has stopped.
    pub fn run_async(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, RunState::Running) {
            RunState::NotStarted(packetizer) => {
                debug!("Starting transport read loop");
                tokio::spawn(read_loop(self.inner.clone(), packetizer));
                Ok(())
            }
            RunState::Running => Ok(()),
            RunState::Stopped => {
                *state = RunState::Stopped;
                Err(Error::EndOfStream)
            }
        }
    }

    /// Start the read loop if needed and wait for the transport to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailed`] if the read loop ended on a framing
    /// or I/O failure, or [`Error::EndOfStream`] if the transport had already
    /// stopped before this call.
    pub async fn run(&self) -> Result<()> {
        self.run_async()?;
        self.inner.stopped.cancelled().await;
        match self.close_reason() {
            Some(CloseReason::Failed(reason)) => Err(Error::TransportFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Request a local stop without waiting for it to finish.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let RunState::NotStarted(_) = &*state {
            *state = RunState::Stopped;
            tokio::spawn(shutdown(self.inner.clone(), CloseReason::Shutdown));
        }
        self.inner.stop.cancel();
    }

    /// Stop the transport and wait for the ordered shutdown to complete.
    pub async fn close(&self) {
        self.stop();
        self.inner.stopped.cancelled().await;
    }

    /// Whether the transport is usable: not stopped and not shutting down.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !matches!(*self.inner.state.lock(), RunState::Stopped)
    }

    /// Why the transport closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Register a channel to be told when the transport closes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] if the transport is already closed.
    pub fn add_close_listener(&self, listener: mpsc::Sender<CloseReason>) -> Result<()> {
        self.inner.receiver.add_close_listener(listener)
    }

    /// Protocols served on this transport.
    #[must_use]
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.inner.registry
    }

    /// Outbound call correlation for this transport.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

async fn read_loop(inner: Arc<TransportInner>, mut packetizer: Packetizer) {
    let reason = loop {
        tokio::select! {
            () = inner.stop.cancelled() => {
                debug!("Transport stop requested");
                break CloseReason::Shutdown;
            }
            packet = packetizer.next_packet() => match packet {
                Some(Ok(packet)) => {
                    if let Err(e) = inner.receiver.receive(packet) {
                        warn!("Failed to handle packet: {e}");
                    }
                }
                Some(Err(e)) => {
                    error!("Transport read failed: {e}");
                    break CloseReason::Failed(e.to_string());
                }
                None => {
                    debug!("Transport reached end of stream");
                    break CloseReason::EndOfStream;
                }
            }
        }
    };

    *inner.state.lock() = RunState::Stopped;
    shutdown(inner, reason).await;
}

async fn shutdown(inner: Arc<TransportInner>, reason: CloseReason) {
    info!(reason = ?reason, "Shutting down transport");
    inner.receiver.close(reason.clone()).await;
    inner.dispatcher.close().await;
    inner.encoder.close().await;
    *inner.close_reason.lock() = Some(reason);
    inner.stopped.cancel();
}
