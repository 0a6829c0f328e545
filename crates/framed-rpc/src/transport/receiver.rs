//! Server-side request handling.
//!
//! In-flight tasks and close listeners live in one actor task. The read loop
//! hands every packet to [`Receiver::receive`], which never blocks: handler
//! work is spawned and bookkeeping goes through the actor's mailbox.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use ciborium::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, MessageKind, Result};
use crate::protocol::message::{MessageType, Packet, RpcMessage, SeqId};
use crate::registry::{CallType, ProtocolRegistry};
use crate::transport::dispatcher::{Dispatcher, ResponsePayload};
use crate::transport::encoder::MessageEncoder;

/// Why a transport closed, as reported to close listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream.
    EndOfStream,
    /// The transport was stopped locally.
    Shutdown,
    /// The read loop failed.
    Failed(String),
}

enum TaskCommand {
    /// Register a task; replies false if the seqid is already taken.
    Start {
        seqid: SeqId,
        cancel: CancellationToken,
        accepted: oneshot::Sender<bool>,
    },
    /// Remove a finished task; replies whether it was still registered.
    Finish {
        seqid: SeqId,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        seqid: SeqId,
    },
    AddListener {
        listener: mpsc::Sender<CloseReason>,
    },
    Close {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// Handle to the receiver actor.
#[derive(Clone)]
pub struct Receiver {
    registry: ProtocolRegistry,
    dispatcher: Dispatcher,
    encoder: Arc<MessageEncoder>,
    tasks: mpsc::UnboundedSender<TaskCommand>,
    shutdown: CancellationToken,
}

impl Receiver {
    /// Spawn the actor. Must be called within a Tokio runtime.
    pub fn new(
        registry: ProtocolRegistry,
        dispatcher: Dispatcher,
        encoder: Arc<MessageEncoder>,
    ) -> Self {
        let (tasks, mailbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_tasks(mailbox, shutdown.clone()));
        Self {
            registry,
            dispatcher,
            encoder,
            tasks,
            shutdown,
        }
    }

    /// Handle one inbound packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] if the receiver has been closed.
    pub fn receive(&self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Message(RpcMessage::Call { seqid, method, arg }) => {
                self.serve_call(seqid, method, arg)
            }
            Packet::Message(RpcMessage::Notify { method, arg }) => {
                self.serve_notify(method, arg);
                Ok(())
            }
            Packet::Message(RpcMessage::Cancel { seqid, method }) => {
                trace!(seqid, method = %method, "Cancel received");
                self.tasks
                    .send(TaskCommand::Cancel { seqid })
                    .map_err(|_| Error::EndOfStream)
            }
            Packet::Message(RpcMessage::Response {
                seqid,
                error,
                result,
            }) => {
                self.dispatcher
                    .deliver(seqid, Ok(ResponsePayload { seqid, error, result }));
                Ok(())
            }
            Packet::Malformed { seqid, error } => {
                match (error.kind, seqid) {
                    (MessageKind::Known(MessageType::Response), Some(seqid)) => {
                        self.dispatcher.deliver(seqid, Err(error.into()));
                    }
                    (MessageKind::Known(MessageType::Call), Some(seqid)) => {
                        warn!(seqid, "Rejecting malformed call: {error}");
                        self.spawn_reply(seqid, Err(error.into()));
                    }
                    _ => warn!("Dropping malformed message: {error}"),
                }
                Ok(())
            }
        }
    }

    fn serve_call(&self, seqid: SeqId, method: String, arg: Value) -> Result<()> {
        let descriptor = match self.registry.lookup(&method) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(seqid, method = %method, "Unknown method: {e}");
                self.spawn_reply(seqid, Err(e));
                return Ok(());
            }
        };
        if descriptor.call_type() != CallType::Call {
            debug!(seqid, method = %method, "Notify method invoked as call");
        }

        let cancel = self.shutdown.child_token();
        let (accepted, was_accepted) = oneshot::channel();
        self.tasks
            .send(TaskCommand::Start {
                seqid,
                cancel: cancel.clone(),
                accepted,
            })
            .map_err(|_| Error::EndOfStream)?;

        let receiver = self.clone();
        tokio::spawn(async move {
            match was_accepted.await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(seqid, method = %method, "Rejecting call with duplicate sequence id");
                    receiver.reply(seqid, Err(Error::DuplicateCall(seqid))).await;
                    return;
                }
                // Receiver closed before the task was registered.
                Err(_) => return,
            }

            let outcome = descriptor.invoke(&method, cancel, arg).await;

            let (reply, still_registered) = oneshot::channel();
            let _ = receiver.tasks.send(TaskCommand::Finish { seqid, reply });
            // A closed receiver drops the reply; the response is still attempted.
            if matches!(still_registered.await, Ok(false)) {
                debug!(seqid, method = %method, "Task was cancelled; dropping its response");
                return;
            }
            receiver.reply(seqid, outcome).await;
        });
        Ok(())
    }

    fn serve_notify(&self, method: String, arg: Value) {
        let descriptor = match self.registry.lookup(&method) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(method = %method, "Dropping notification: {e}");
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = descriptor.invoke(&method, cancel, arg).await {
                warn!(method = %method, "Notification handler failed: {e}");
            }
        });
    }

    fn spawn_reply(&self, seqid: SeqId, outcome: Result<Value>) {
        let receiver = self.clone();
        tokio::spawn(async move { receiver.reply(seqid, outcome).await });
    }

    async fn reply(&self, seqid: SeqId, outcome: Result<Value>) {
        let (error, result) = match outcome {
            Ok(result) => (None, result),
            Err(e) => (Some(self.registry.wrap_error(&e)), Value::Null),
        };
        if let Err(e) = self.encoder.send(&RpcMessage::Response { seqid, error, result }).await {
            debug!(seqid, "Failed to send response: {e}");
        }
    }

    /// Register a channel to be told when the transport closes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] if the receiver is already closed.
    pub fn add_close_listener(&self, listener: mpsc::Sender<CloseReason>) -> Result<()> {
        self.tasks
            .send(TaskCommand::AddListener { listener })
            .map_err(|_| Error::EndOfStream)
    }

    /// Cancel every in-flight task and notify close listeners.
    pub async fn close(&self, reason: CloseReason) {
        let (done, closed) = oneshot::channel();
        if self.tasks.send(TaskCommand::Close { reason, done }).is_ok() {
            let _ = closed.await;
        }
    }
}

async fn run_tasks(mut mailbox: mpsc::UnboundedReceiver<TaskCommand>, shutdown: CancellationToken) {
    let mut tasks: HashMap<SeqId, CancellationToken> = HashMap::new();
    let mut listeners: Vec<mpsc::Sender<CloseReason>> = Vec::new();
    let mut closing = None;

    while let Some(command) = mailbox.recv().await {
        match command {
            TaskCommand::Start {
                seqid,
                cancel,
                accepted,
            } => {
                let fresh = match tasks.entry(seqid) {
                    Entry::Occupied(_) => false,
                    Entry::Vacant(slot) => {
                        slot.insert(cancel);
                        true
                    }
                };
                let _ = accepted.send(fresh);
            }
            TaskCommand::Finish { seqid, reply } => {
                let _ = reply.send(tasks.remove(&seqid).is_some());
            }
            TaskCommand::Cancel { seqid } => match tasks.remove(&seqid) {
                Some(cancel) => {
                    debug!(seqid, "Cancelling task");
                    cancel.cancel();
                }
                None => trace!(seqid, "Cancel for unknown task ignored"),
            },
            TaskCommand::AddListener { listener } => listeners.push(listener),
            TaskCommand::Close { reason, done } => {
                closing = Some((reason, done));
                break;
            }
        }
    }

    shutdown.cancel();
    mailbox.close();

    let (reason, done) = match closing {
        Some((reason, done)) => (reason, Some(done)),
        None => (CloseReason::Shutdown, None),
    };

    while let Ok(command) = mailbox.try_recv() {
        match command {
            TaskCommand::AddListener { listener } => listeners.push(listener),
            TaskCommand::Close { done, .. } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }

    if !tasks.is_empty() {
        debug!("Cancelled {} in-flight tasks on close", tasks.len());
    }
    for listener in listeners {
        if let Err(e) = listener.try_send(reason.clone()) {
            error!("Failed to notify close listener: {e}");
        }
    }

    if let Some(done) = done {
        let _ = done.send(());
    }
}
