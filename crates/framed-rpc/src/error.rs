//! Error types for the framed RPC transport.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::message::{MessageType, SeqId};

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An application-level error produced by a handler or recovered from the wire.
pub type AppError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame header or body; the stream cannot be trusted past it.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A message had the right framing but the wrong field shapes.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A value could not be serialized for the wire.
    #[error("Failed to encode {context}: {reason}")]
    Encode {
        /// What was being encoded.
        context: &'static str,
        /// Serializer message.
        reason: String,
    },

    /// No protocol with this name is registered.
    #[error("Protocol not found: {0}")]
    ProtocolNotFound(String),

    /// The protocol exists but does not define this method.
    #[error("Method not found: {protocol}.{method}")]
    MethodNotFound {
        /// Protocol that was found.
        protocol: String,
        /// Method that was missing.
        method: String,
    },

    /// A protocol with this name is already registered.
    #[error("Protocol already registered: {0}")]
    AlreadyRegistered(String),

    /// The argument on the wire does not match the registered handler's type.
    #[error("Argument type mismatch for {method}: {reason}")]
    TypeMismatch {
        /// Fully qualified method name.
        method: String,
        /// Deserializer message.
        reason: String,
    },

    /// The caller's context was cancelled before the call settled.
    #[error("Call {seqid} to {method} was canceled")]
    CallCanceled {
        /// Sequence id of the call.
        seqid: SeqId,
        /// Method name of the call.
        method: String,
    },

    /// The peer reused the sequence id of a call that is still being served.
    #[error("Call {0} is already in progress")]
    DuplicateCall(SeqId),

    /// A response arrived for a sequence id with no pending call.
    #[error("No pending call for response {0}")]
    CallNotFound(SeqId),

    /// A response carried neither an error nor a usable result.
    #[error("Response to call {0} carried no result")]
    NilResult(SeqId),

    /// Error returned by a remote or local handler.
    #[error("{0}")]
    Application(AppError),

    /// The connection reached end of stream or was closed locally.
    #[error("End of stream")]
    EndOfStream,

    /// The read loop ended because of a framing or I/O failure.
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Dialing a transport failed before any stream was established.
    #[error("Dial failed: {0}")]
    Dial(String),

    /// A wait was abandoned because its context was cancelled.
    #[error("Operation canceled")]
    Canceled,

    /// The connection was shut down and cannot be used anymore.
    #[error("Connection has been shut down")]
    ShutDown,

    /// A reconnect attempt failed with an error the handler deemed fatal.
    #[error("Reconnect failed: {0}")]
    Reconnect(Arc<Error>),
}

impl Error {
    /// Whether this error means the underlying stream is gone.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Whether this error is a cancellation of the caller's context.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::CallCanceled { .. } | Self::Canceled)
    }

    /// Returns the application error, if this is one.
    #[must_use]
    pub fn as_application(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Application(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// A strict decoding failure for one message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to decode {kind} message ({field_count} fields): {cause}")]
pub struct DecodeError {
    /// Kind of the message, once the tag could be read.
    pub kind: MessageKind,
    /// Number of fields in the message array.
    pub field_count: usize,
    /// What went wrong.
    pub cause: String,
}

/// Message kind as known at the point a decode error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// The tag was readable.
    Known(MessageType),
    /// The tag was missing or not a known discriminator.
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(kind) => write!(f, "{kind}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A plain-text error recovered from the wire by the default unwrapper.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RemoteError(pub String);

impl From<ciborium::ser::Error<io::Error>> for Error {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::Encode {
            context: "frame body",
            reason: err.to_string(),
        }
    }
}
