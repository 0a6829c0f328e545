//! Client facade over a transport.

use std::future::Future;
use std::sync::Arc;

use ciborium::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{AppError, DecodeError, Error, MessageKind, RemoteError, Result};
use crate::protocol::codec;
use crate::protocol::message::MessageType;
use crate::transport::{ResponsePayload, Transport};

/// Recovers an application error from a response's error slot.
pub trait ErrorUnwrapper: Send + Sync + 'static {
    /// Convert the wire error value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be interpreted.
    fn unwrap_error(&self, raw: Value) -> Result<AppError>;
}

/// Reads text errors as [`RemoteError`]; any other value is shown in debug form.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringErrorUnwrapper;

impl ErrorUnwrapper for StringErrorUnwrapper {
    fn unwrap_error(&self, raw: Value) -> Result<AppError> {
        Ok(match raw {
            Value::Text(message) => Box::new(RemoteError(message)),
            other => Box::new(RemoteError(format!("{other:?}"))),
        })
    }
}

/// Anything that can issue calls and notifications.
pub trait GenericClient: Send + Sync {
    /// Call `method` and wait for its result.
    fn call<A, R>(
        &self,
        ctx: &CancellationToken,
        method: &str,
        arg: &A,
    ) -> impl Future<Output = Result<R>> + Send
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send;

    /// Send a notification to `method`.
    fn notify<A>(
        &self,
        ctx: &CancellationToken,
        method: &str,
        arg: &A,
    ) -> impl Future<Output = Result<()>> + Send
    where
        A: Serialize + Sync + ?Sized;
}

/// Issues calls over one transport.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    unwrapper: Arc<dyn ErrorUnwrapper>,
}

impl Client {
    /// Create a client using [`StringErrorUnwrapper`].
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self::with_error_unwrapper(transport, Arc::new(StringErrorUnwrapper))
    }

    /// Create a client with a custom error unwrapper.
    #[must_use]
    pub fn with_error_unwrapper(transport: Transport, unwrapper: Arc<dyn ErrorUnwrapper>) -> Self {
        Self {
            transport,
            unwrapper,
        }
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Call `method` with `arg` and decode the result.
    ///
    /// Starts the transport's read loop if it is not running yet.
    ///
    /// # Errors
    ///
    /// Returns the peer's error as [`Error::Application`], a cancellation
    /// error if `ctx` fires first, [`Error::EndOfStream`] if the transport
    /// closes, or a decode error if the result has the wrong shape.
    #[instrument(skip(self, ctx, arg))]
    pub async fn call<A, R>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.transport.run_async()?;
        let arg = codec::to_value(arg, "argument")?;
        let payload = self.transport.dispatcher().call(ctx, method, arg).await?;
        self.decode_response(payload)
    }

    /// Send a notification; returns once the frame is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] if `ctx` is cancelled before the frame is
    /// written, or the send error.
    pub async fn notify<A>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
    {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        self.transport.run_async()?;
        let arg = codec::to_value(arg, "argument")?;
        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(Error::Canceled),
            sent = self.transport.dispatcher().notify(method, arg) => sent,
        }
    }

    fn decode_response<R: DeserializeOwned>(&self, payload: ResponsePayload) -> Result<R> {
        if let Some(raw) = payload.error {
            return Err(Error::Application(self.unwrapper.unwrap_error(raw)?));
        }

        codec::from_value(&payload.result).map_err(|cause| {
            if payload.result == Value::Null {
                Error::NilResult(payload.seqid)
            } else {
                Error::Decode(DecodeError {
                    kind: MessageKind::Known(MessageType::Response),
                    field_count: MessageType::Response.field_count(),
                    cause: format!("result: {cause}"),
                })
            }
        })
    }
}

impl GenericClient for Client {
    async fn call<A, R>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        Self::call(self, ctx, method, arg).await
    }

    async fn notify<A>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
    {
        Self::notify(self, ctx, method, arg).await
    }
}
