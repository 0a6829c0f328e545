//! Server facade over a transport.

use tokio::sync::mpsc;

use crate::error::Result;
use crate::registry::Protocol;
use crate::transport::{CloseReason, Transport};

/// Serves registered protocols over one transport.
#[derive(Clone)]
pub struct Server {
    transport: Transport,
}

impl Server {
    /// Create a server for `transport`.
    #[must_use]
    pub const fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Register a protocol.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AlreadyRegistered`] if the name is taken.
    pub fn register(&self, protocol: Protocol) -> Result<()> {
        self.transport.registry().register(protocol)
    }

    /// Start serving. With `background` the read loop is spawned and this
    /// returns immediately; otherwise it returns when the transport stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport already stopped, or, when not in the
    /// background, if the read loop failed.
    pub async fn run(&self, background: bool) -> Result<()> {
        if background {
            self.transport.run_async()
        } else {
            self.transport.run().await
        }
    }

    /// Register a channel to be told when the transport closes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::EndOfStream`] if the transport is already closed.
    pub fn add_close_listener(&self, listener: mpsc::Sender<CloseReason>) -> Result<()> {
        self.transport.add_close_listener(listener)
    }
}
