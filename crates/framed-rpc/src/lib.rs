//! Bidirectional, multiplexed RPC over a single byte stream.
//!
//! Either side of a connection can call methods the other side registered,
//! send fire-and-forget notifications, and cancel calls still in flight.
//! Messages are CBOR arrays behind a length prefix, so any ordered reliable
//! stream (TCP, TLS, a Unix socket, an in-memory pipe) can carry them.
//!
//! # Features
//!
//! - **Multiplexing**: Any number of concurrent calls in both directions
//! - **Cancellation**: Dropping or cancelling a call tells the peer to stop
//! - **Typed Handlers**: Arguments and results go through serde
//! - **Reconnection**: [`Connection`] redials with exponential backoff and
//!   retries commands across outages
//!
//! # Example
//!
//! ```no_run
//! use proven_framed_rpc::{
//!     CancellationToken, Client, MethodDescriptor, Protocol, Server, Transport,
//!     TransportConfig,
//! };
//! use tokio::net::TcpStream;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("127.0.0.1:7000").await?;
//!     let transport = Transport::new(stream, TransportConfig::default());
//!
//!     let server = Server::new(transport.clone());
//!     server.register(Protocol::new("math").method(
//!         "double",
//!         MethodDescriptor::call(|_ctx, n: u64| async move {
//!             Ok::<_, std::io::Error>(n * 2)
//!         }),
//!     ))?;
//!     server.run(true).await?;
//!
//!     let client = Client::new(transport);
//!     let sum: u64 = client
//!         .call(&CancellationToken::new(), "remote.add", &(1, 2))
//!         .await?;
//!     println!("{sum}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffPolicy, retry_notify};
pub use client::{Client, ErrorUnwrapper, GenericClient, StringErrorUnwrapper};
pub use connection::{
    Connection, ConnectionClient, ConnectionHandler, ConnectionOptions, DisconnectStatus,
    transport::{ConnectionTransport, TcpConnectionTransport, TransportStage, dial_tcp},
};
pub use error::{AppError, Error, RemoteError, Result};
pub use protocol::message::SeqId;
pub use registry::{
    CallType, ErrorWrapper, MethodDescriptor, Protocol, ProtocolRegistry, StringErrorWrapper,
};
pub use server::Server;
pub use transport::{CloseReason, Transport, TransportConfig};

// Re-export dependencies that are part of our public API
pub use ciborium::Value;
pub use tokio_util::sync::CancellationToken;
