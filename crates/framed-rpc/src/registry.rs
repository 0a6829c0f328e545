//! Protocol registration and method lookup.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use ciborium::Value;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AppError, Error, Result};
use crate::protocol::codec;

/// Type alias for boxed futures.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Whether a method expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// The caller waits for a response.
    Call,
    /// Fire-and-forget; no response is sent.
    Notify,
}

/// Turns an error into its wire representation.
pub trait ErrorWrapper: Send + Sync + 'static {
    /// Produce the value placed in a response's error slot.
    fn wrap_error(&self, err: &(dyn std::error::Error + Send + Sync + 'static)) -> Value;
}

/// Sends the error's display string.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringErrorWrapper;

impl ErrorWrapper for StringErrorWrapper {
    fn wrap_error(&self, err: &(dyn std::error::Error + Send + Sync + 'static)) -> Value {
        Value::Text(err.to_string())
    }
}

/// Type-erased method implementation.
trait MethodHandler: Send + Sync {
    fn invoke(
        &self,
        method: &str,
        ctx: CancellationToken,
        arg: Value,
    ) -> BoxedFuture<Result<Value>>;

    fn arg_type(&self) -> &'static str;
}

/// Typed method implementation; the argument type is checked on entry.
struct TypedHandler<A, R, F> {
    handler: F,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<A, R, E, F, Fut> MethodHandler for TypedHandler<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    E: Into<AppError> + 'static,
    F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    fn invoke(
        &self,
        method: &str,
        ctx: CancellationToken,
        arg: Value,
    ) -> BoxedFuture<Result<Value>> {
        let arg = match codec::from_value::<A>(&arg) {
            Ok(arg) => arg,
            Err(reason) => {
                let err = Error::TypeMismatch {
                    method: method.to_string(),
                    reason,
                };
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.handler)(ctx, arg);
        Box::pin(async move {
            let result = fut.await.map_err(|e| Error::Application(e.into()))?;
            codec::to_value(&result, "result")
        })
    }

    fn arg_type(&self) -> &'static str {
        std::any::type_name::<A>()
    }
}

/// One registered method: its handler and whether it replies.
#[derive(Clone)]
pub struct MethodDescriptor {
    call_type: CallType,
    handler: Arc<dyn MethodHandler>,
}

impl MethodDescriptor {
    /// A reply-expecting method.
    pub fn call<A, R, E, F, Fut>(handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        E: Into<AppError> + 'static,
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        Self::typed(CallType::Call, handler)
    }

    /// A fire-and-forget method.
    pub fn notify<A, E, F, Fut>(handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        E: Into<AppError> + 'static,
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        Self::typed(CallType::Notify, handler)
    }

    fn typed<A, R, E, F, Fut>(call_type: CallType, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        E: Into<AppError> + 'static,
        F: Fn(CancellationToken, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        Self {
            call_type,
            handler: Arc::new(TypedHandler {
                handler,
                _phantom: PhantomData,
            }),
        }
    }

    /// Whether this method replies.
    #[must_use]
    pub const fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Name of the argument type the handler accepts.
    #[must_use]
    pub fn arg_type(&self) -> &'static str {
        self.handler.arg_type()
    }

    /// Run the handler against a wire argument.
    pub(crate) fn invoke(
        &self,
        method: &str,
        ctx: CancellationToken,
        arg: Value,
    ) -> BoxedFuture<Result<Value>> {
        self.handler.invoke(method, ctx, arg)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("call_type", &self.call_type)
            .field("arg_type", &self.arg_type())
            .finish()
    }
}

/// A named group of methods.
#[derive(Debug, Clone)]
pub struct Protocol {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl Protocol {
    /// Create an empty protocol.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method. A later method with the same name replaces the earlier one.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, descriptor: MethodDescriptor) -> Self {
        self.methods.insert(name.into(), descriptor);
        self
    }

    /// The protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up one method by its short name.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }
}

/// Registry of protocols served on one transport.
#[derive(Clone)]
pub struct ProtocolRegistry {
    protocols: Arc<DashMap<String, Arc<Protocol>>>,
    wrapper: Arc<dyn ErrorWrapper>,
}

impl ProtocolRegistry {
    /// Create an empty registry using the given error wrapper.
    pub fn new(wrapper: Arc<dyn ErrorWrapper>) -> Self {
        Self {
            protocols: Arc::new(DashMap::new()),
            wrapper,
        }
    }

    /// Register a protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if the name is taken; the existing
    /// registration is kept.
    pub fn register(&self, protocol: Protocol) -> Result<()> {
        match self.protocols.entry(protocol.name.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(protocol.name)),
            Entry::Vacant(slot) => {
                info!(
                    protocol = %protocol.name,
                    methods = protocol.methods.len(),
                    "Registered protocol"
                );
                slot.insert(Arc::new(protocol));
                Ok(())
            }
        }
    }

    /// Resolve `protocol.method` into its descriptor.
    ///
    /// The name is split at the last `.`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolNotFound`] or [`Error::MethodNotFound`].
    pub fn lookup(&self, full_method: &str) -> Result<MethodDescriptor> {
        let (protocol_name, method) = full_method.rsplit_once('.').unwrap_or(("", full_method));

        let protocol = self
            .protocols
            .get(protocol_name)
            .ok_or_else(|| Error::ProtocolNotFound(protocol_name.to_string()))?;

        let descriptor = protocol.get(method).cloned().ok_or_else(|| Error::MethodNotFound {
            protocol: protocol_name.to_string(),
            method: method.to_string(),
        })?;

        debug!(method = full_method, arg_type = descriptor.arg_type(), "Resolved method");
        Ok(descriptor)
    }

    /// Wire representation of an error raised while serving a call.
    ///
    /// Application errors are handed to the wrapper unchanged, bookkeeping
    /// errors are wrapped as themselves.
    #[must_use]
    pub fn wrap_error(&self, err: &Error) -> Value {
        match err {
            Error::Application(app) => self.wrapper.wrap_error(&**app),
            other => self.wrapper.wrap_error(other),
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new(Arc::new(StringErrorWrapper))
    }
}
