//! Reconnecting connection built on top of a transport factory.
//!
//! A [`Connection`] keeps one live [`Client`]/[`Server`] pair and replaces it
//! whenever the underlying transport goes away. Only one reconnect runs at a
//! time; every caller that needs a connection while it is in progress waits
//! on the same attempt.

pub mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{self, ExponentialBackoffPolicy};
use crate::client::{Client, ErrorUnwrapper, GenericClient, StringErrorUnwrapper};
use crate::error::{Error, Result};
use crate::registry::Protocol;
use crate::server::Server;
use crate::transport::Transport;

pub use transport::{ConnectionTransport, TcpConnectionTransport, TransportStage};

/// What a reconnect attempt is recovering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    /// Joined an attempt that was already running.
    UsingExistingConnection,
    /// No connection has been made before.
    StartingFirstConnection,
    /// A previous connection was lost.
    StartingNonFirstConnection,
}

/// Caller-supplied policy and lifecycle hooks.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Runs after a transport is dialed and before it is published to
    /// callers. The read loop is already running, so calls may be made here.
    ///
    /// # Errors
    ///
    /// An error rejects the transport; it is classified like a dial error.
    async fn on_connect(&self, client: &Client, server: &Server) -> Result<()> {
        let _ = (client, server);
        Ok(())
    }

    /// A connect attempt failed and will be retried after `wait`.
    fn on_connect_error(&self, err: &Error, wait: Duration) {
        debug!(handler = self.handler_name(), ?wait, "Connect failed: {err}");
    }

    /// A command failed with a retryable error and will be retried after `wait`.
    fn on_do_command_error(&self, err: &Error, wait: Duration) {
        debug!(handler = self.handler_name(), ?wait, "Command failed: {err}");
    }

    /// A reconnect attempt is starting.
    async fn on_disconnected(&self, status: DisconnectStatus) {
        debug!(handler = self.handler_name(), ?status, "Disconnected");
    }

    /// Whether command `name` should be retried after `err`.
    fn should_retry(&self, name: &str, err: &Error) -> bool {
        let _ = (name, err);
        false
    }

    /// Whether connecting should be retried after `err`.
    fn should_retry_on_connect(&self, err: &Error) -> bool {
        let _ = err;
        true
    }

    /// Name used in logs.
    fn handler_name(&self) -> &str;
}

/// Options for a [`Connection`].
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Protocols registered on every new server facade.
    pub protocols: Vec<Protocol>,
    /// Don't start connecting until the first command needs it.
    pub dont_connect_now: bool,
    /// Backoff between connect attempts.
    pub reconnect_backoff: ExponentialBackoffPolicy,
    /// Backoff between retries of a command.
    pub command_backoff: ExponentialBackoffPolicy,
    /// Wait a random time up to this window before reconnecting after a
    /// connection was lost.
    pub initial_reconnect_backoff_window: Option<Duration>,
    /// Treat the first connect as a reconnect, so it reports
    /// [`DisconnectStatus::StartingNonFirstConnection`] and waits out the
    /// initial reconnect window. For connections replacing a dropped one.
    pub force_initial_backoff: bool,
    /// Recovers application errors from responses.
    pub error_unwrapper: Arc<dyn ErrorUnwrapper>,
}

impl ConnectionOptions {
    /// Register `protocol` on every connection.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Defer connecting until first use.
    #[must_use]
    pub const fn with_dont_connect_now(mut self, dont_connect_now: bool) -> Self {
        self.dont_connect_now = dont_connect_now;
        self
    }

    /// Set the reconnect backoff.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, policy: ExponentialBackoffPolicy) -> Self {
        self.reconnect_backoff = policy;
        self
    }

    /// Set the command retry backoff.
    #[must_use]
    pub fn with_command_backoff(mut self, policy: ExponentialBackoffPolicy) -> Self {
        self.command_backoff = policy;
        self
    }

    /// Set the random pre-reconnect window.
    #[must_use]
    pub const fn with_initial_reconnect_backoff_window(mut self, window: Option<Duration>) -> Self {
        self.initial_reconnect_backoff_window = window;
        self
    }

    /// Back off before the very first connect as well.
    #[must_use]
    pub const fn with_force_initial_backoff(mut self, force: bool) -> Self {
        self.force_initial_backoff = force;
        self
    }

    /// Set the error unwrapper for client facades.
    #[must_use]
    pub fn with_error_unwrapper(mut self, unwrapper: Arc<dyn ErrorUnwrapper>) -> Self {
        self.error_unwrapper = unwrapper;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            dont_connect_now: false,
            reconnect_backoff: ExponentialBackoffPolicy::default(),
            command_backoff: ExponentialBackoffPolicy::default(),
            initial_reconnect_backoff_window: None,
            force_initial_backoff: false,
            error_unwrapper: Arc::new(StringErrorUnwrapper),
        }
    }
}

/// One in-flight reconnect; waiters block on `done`.
struct ReconnectAttempt {
    done: CancellationToken,
    fatal: Mutex<Option<Arc<Error>>>,
}

#[derive(Default)]
struct SessionState {
    client: Option<Client>,
    server: Option<Server>,
    reconnect: Option<Arc<ReconnectAttempt>>,
    reconnect_cancel: Option<CancellationToken>,
    reconnected_before: bool,
    shut_down: bool,
}

struct ConnectionInner {
    transport: Arc<dyn ConnectionTransport>,
    handler: Arc<dyn ConnectionHandler>,
    options: ConnectionOptions,
    state: Mutex<SessionState>,
    fire_now: Notify,
}

/// A self-healing RPC connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection. Unless `options.dont_connect_now` is set, the
    /// first connect starts immediately in the background. Must be called
    /// within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn ConnectionTransport>,
        handler: Arc<dyn ConnectionHandler>,
        options: ConnectionOptions,
    ) -> Self {
        let state = SessionState {
            reconnected_before: options.force_initial_backoff,
            ..SessionState::default()
        };
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                transport,
                handler,
                options,
                state: Mutex::new(state),
                fire_now: Notify::new(),
            }),
        };

        if !connection.inner.options.dont_connect_now {
            let mut state = connection.inner.state.lock();
            connection.reconnect_attempt_locked(&mut state);
        }
        connection
    }

    /// Run `command` against the current client, waiting for a connection
    /// first. Errors the handler classifies as retryable are retried with
    /// the command backoff; end of stream triggers a reconnect and a retry.
    ///
    /// # Errors
    ///
    /// Returns the command's error, [`Error::Canceled`] if `ctx` fires while
    /// waiting for a connection, [`Error::ShutDown`] after [`Self::shutdown`],
    /// or [`Error::Reconnect`] if reconnecting failed fatally.
    #[instrument(skip(self, ctx, command), fields(handler = self.inner.handler.handler_name()))]
    pub async fn do_command<T, F, Fut>(
        &self,
        ctx: &CancellationToken,
        name: &str,
        mut command: F,
    ) -> Result<T>
    where
        F: FnMut(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            self.wait_for_connection(ctx, false).await?;

            let handler = &self.inner.handler;
            let result = backoff::retry_notify(
                self.inner.options.command_backoff.start(),
                || {
                    let attempt = self.current_client().map(&mut command);
                    async move {
                        match attempt {
                            Some(attempt) => attempt.await,
                            None => Err(Error::EndOfStream),
                        }
                    }
                },
                |err| handler.should_retry(name, err),
                |err, wait| handler.on_do_command_error(err, wait),
            )
            .await;

            match result {
                Err(err) if err.is_end_of_stream() => {
                    debug!(command = name, "Connection lost during command; reconnecting");
                }
                other => return other,
            }
        }
    }

    /// Force a new connection even if the current one looks healthy.
    ///
    /// # Errors
    ///
    /// Same as waiting for a connection in [`Self::do_command`].
    pub async fn force_reconnect(&self, ctx: &CancellationToken) -> Result<()> {
        self.wait_for_connection(ctx, true).await
    }

    /// Whether a connection is currently published.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        self.is_connected_locked(&state)
    }

    /// A client whose calls go through [`Self::do_command`].
    #[must_use]
    pub fn get_client(&self) -> ConnectionClient {
        ConnectionClient { conn: self.clone() }
    }

    /// The server facade of the current connection, if any.
    #[must_use]
    pub fn get_server(&self) -> Option<Server> {
        self.inner.state.lock().server.clone()
    }

    /// Cancel any reconnect in progress and close the transport. The
    /// connection cannot be used afterwards.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        if let Some(cancel) = state.reconnect_cancel.take() {
            cancel.cancel();
        }
        info!(handler = self.inner.handler.handler_name(), "Shutting down connection");
        self.inner.transport.close();
    }

    /// Skip the rest of the random pre-reconnect wait, if one is running.
    pub fn fast_forward_initial_backoff(&self) {
        self.inner.fire_now.notify_waiters();
    }

    fn current_client(&self) -> Option<Client> {
        self.inner.state.lock().client.clone()
    }

    fn is_connected_locked(&self, state: &SessionState) -> bool {
        state.client.is_some() && self.inner.transport.is_connected()
    }

    async fn wait_for_connection(
        &self,
        ctx: &CancellationToken,
        force_reconnect: bool,
    ) -> Result<()> {
        let (attempt, status) = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(Error::ShutDown);
            }
            if !force_reconnect && self.is_connected_locked(&state) {
                return Ok(());
            }
            self.reconnect_attempt_locked(&mut state)
        };
        debug!(status = ?status, "Waiting for connection");

        tokio::select! {
            () = ctx.cancelled() => Err(Error::Canceled),
            () = attempt.done.cancelled() => {
                let fatal = attempt.fatal.lock().clone();
                match fatal {
                    None => Ok(()),
                    Some(err) if matches!(*err, Error::ShutDown) => Err(Error::ShutDown),
                    Some(err) => Err(Error::Reconnect(err)),
                }
            }
        }
    }

    /// Join the running reconnect, or start one.
    fn reconnect_attempt_locked(
        &self,
        state: &mut SessionState,
    ) -> (Arc<ReconnectAttempt>, DisconnectStatus) {
        if let Some(attempt) = &state.reconnect {
            return (attempt.clone(), DisconnectStatus::UsingExistingConnection);
        }

        let status = if state.reconnected_before {
            DisconnectStatus::StartingNonFirstConnection
        } else {
            state.reconnected_before = true;
            DisconnectStatus::StartingFirstConnection
        };

        let attempt = Arc::new(ReconnectAttempt {
            done: CancellationToken::new(),
            fatal: Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        state.reconnect = Some(attempt.clone());
        state.reconnect_cancel = Some(cancel.clone());

        tokio::spawn(self.clone().reconnect(cancel, status, attempt.clone()));
        (attempt, status)
    }

    async fn reconnect(
        self,
        cancel: CancellationToken,
        status: DisconnectStatus,
        attempt: Arc<ReconnectAttempt>,
    ) {
        let handler = self.inner.handler.clone();
        handler.on_disconnected(status).await;

        if status == DisconnectStatus::StartingNonFirstConnection {
            if let Some(window) = self.inner.options.initial_reconnect_backoff_window {
                let wait = window.mul_f64(fastrand::f64());
                debug!(handler = handler.handler_name(), ?wait, "Waiting before reconnecting");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = self.inner.fire_now.notified() => debug!("Reconnect wait fast-forwarded"),
                    () = cancel.cancelled() => {}
                }
            }
        }

        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::ShutDown),
            result = backoff::retry_notify(
                self.inner.options.reconnect_backoff.start(),
                || self.connect(&cancel),
                |err| !cancel.is_cancelled() && handler.should_retry_on_connect(err),
                |err, wait| handler.on_connect_error(err, wait),
            ) => result,
        };
        let result = if cancel.is_cancelled() { Err(Error::ShutDown) } else { result };

        match &result {
            Ok(()) => info!(handler = handler.handler_name(), "Connected"),
            Err(e) => warn!(handler = handler.handler_name(), "Giving up on reconnecting: {e}"),
        }
        if let Err(e) = result {
            *attempt.fatal.lock() = Some(Arc::new(e));
        }

        let mut state = self.inner.state.lock();
        attempt.done.cancel();
        state.reconnect = None;
        state.reconnect_cancel = None;
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let transport = self.inner.transport.dial(cancel).await?;

        let result = self.establish(&transport).await;
        if let Err(e) = &result {
            debug!("Discarding dialed transport: {e}");
            transport.stop();
        }
        result
    }

    /// Start serving on a dialed transport, run the connect hook and publish it.
    async fn establish(&self, transport: &Transport) -> Result<()> {
        let client = Client::with_error_unwrapper(
            transport.clone(),
            self.inner.options.error_unwrapper.clone(),
        );
        let server = Server::new(transport.clone());
        for protocol in &self.inner.options.protocols {
            if let Err(e) = server.register(protocol.clone()) {
                warn!("Failed to register protocol: {e}");
            }
        }
        server.run(true).await?;

        self.inner.handler.on_connect(&client, &server).await?;

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(Error::ShutDown);
        }
        state.client = Some(client);
        state.server = Some(server);
        self.inner.transport.finalize();
        Ok(())
    }
}

/// Client facade whose calls survive reconnects.
#[derive(Clone)]
pub struct ConnectionClient {
    conn: Connection,
}

impl GenericClient for ConnectionClient {
    async fn call<A, R>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        self.conn
            .do_command(ctx, method, |client| async move { client.call(ctx, method, arg).await })
            .await
    }

    async fn notify<A>(&self, ctx: &CancellationToken, method: &str, arg: &A) -> Result<()>
    where
        A: Serialize + Sync + ?Sized,
    {
        self.conn
            .do_command(ctx, method, |client| async move { client.notify(ctx, method, arg).await })
            .await
    }
}
