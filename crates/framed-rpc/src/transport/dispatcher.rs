//! Client-side call correlation.
//!
//! The table of outstanding calls is owned by a single actor task. Callers,
//! the read loop and cancellation all talk to it through one mailbox, so the
//! first of a response or a cancellation to reach the actor settles the call
//! and the other finds nothing left to settle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ciborium::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::message::{RpcMessage, SeqId};
use crate::transport::encoder::MessageEncoder;

/// Raw response to one call, before error unwrapping and result decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePayload {
    /// Sequence id of the call.
    pub seqid: SeqId,
    /// Wrapped error from the peer, if any.
    pub error: Option<Value>,
    /// Result payload.
    pub result: Value,
}

type CallOutcome = Result<ResponsePayload>;

struct PendingCall {
    method: String,
    reply: oneshot::Sender<CallOutcome>,
}

enum Command {
    Register {
        seqid: SeqId,
        method: String,
        reply: oneshot::Sender<CallOutcome>,
    },
    Deliver {
        seqid: SeqId,
        outcome: CallOutcome,
    },
    /// Settle with a cancellation error and tell the peer.
    Cancel { seqid: SeqId },
    /// Drop the entry without telling the peer.
    Abandon { seqid: SeqId },
    Close { done: oneshot::Sender<()> },
}

/// Handle to the dispatcher actor.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<Command>,
    next_seqid: Arc<AtomicU32>,
    encoder: Arc<MessageEncoder>,
}

impl Dispatcher {
    /// Spawn the actor. Must be called within a Tokio runtime.
    pub fn new(encoder: Arc<MessageEncoder>) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        tokio::spawn(run_calls(mailbox, encoder.clone()));
        Self {
            commands,
            next_seqid: Arc::new(AtomicU32::new(0)),
            encoder,
        }
    }

    /// Send a call and wait for its response or for `ctx` to be cancelled.
    ///
    /// Dropping the returned future before it completes cancels the call in
    /// the same way as cancelling `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallCanceled`] if `ctx` fires first,
    /// [`Error::EndOfStream`] if the transport closes, or a send error.
    pub async fn call(&self, ctx: &CancellationToken, method: &str, arg: Value) -> CallOutcome {
        let seqid = self.next_seqid.fetch_add(1, Ordering::Relaxed);
        if ctx.is_cancelled() {
            return Err(Error::CallCanceled {
                seqid,
                method: method.to_string(),
            });
        }

        let (reply, mut outcome) = oneshot::channel();
        self.commands
            .send(Command::Register {
                seqid,
                method: method.to_string(),
                reply,
            })
            .map_err(|_| Error::EndOfStream)?;
        let mut guard = CancelOnDrop {
            commands: &self.commands,
            seqid,
            armed: true,
        };

        let message = RpcMessage::Call {
            seqid,
            method: method.to_string(),
            arg,
        };
        // The writer may be stuck behind a peer that stopped reading.
        let sent = tokio::select! {
            biased;
            () = ctx.cancelled() => None,
            sent = self.encoder.send(&message) => Some(sent),
        };
        match sent {
            Some(Ok(())) => trace!(seqid, method, "Call sent"),
            Some(Err(e)) => {
                guard.armed = false;
                let _ = self.commands.send(Command::Abandon { seqid });
                return Err(e);
            }
            None => {
                debug!(seqid, method, "Call context cancelled before the call was sent");
                guard.armed = false;
                let _ = self.commands.send(Command::Cancel { seqid });
                return outcome.await.unwrap_or(Err(Error::EndOfStream));
            }
        }

        let settled = tokio::select! {
            biased;
            settled = &mut outcome => Some(settled),
            () = ctx.cancelled() => None,
        };
        let settled = match settled {
            Some(settled) => settled,
            None => {
                debug!(seqid, method, "Call context cancelled");
                let _ = self.commands.send(Command::Cancel { seqid });
                // The actor settles the call locally; this never waits on the peer.
                outcome.await
            }
        };
        guard.armed = false;

        settled.unwrap_or(Err(Error::EndOfStream))
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn notify(&self, method: &str, arg: Value) -> Result<()> {
        self.encoder
            .send(&RpcMessage::Notify {
                method: method.to_string(),
                arg,
            })
            .await
    }

    /// Route a response (or a decode failure for one) to its call.
    pub fn deliver(&self, seqid: SeqId, outcome: CallOutcome) {
        if self.commands.send(Command::Deliver { seqid, outcome }).is_err() {
            debug!(seqid, "Dispatcher closed; dropping response");
        }
    }

    /// Fail every outstanding call with end of stream and stop the actor.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }
}

/// Cancels the call if the waiting future is dropped before it settles.
struct CancelOnDrop<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    seqid: SeqId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel { seqid: self.seqid });
        }
    }
}

async fn run_calls(mut mailbox: mpsc::UnboundedReceiver<Command>, encoder: Arc<MessageEncoder>) {
    let mut calls: HashMap<SeqId, PendingCall> = HashMap::new();
    let mut closed = None;

    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Register {
                seqid,
                method,
                reply,
            } => {
                calls.insert(seqid, PendingCall { method, reply });
            }
            Command::Deliver { seqid, outcome } => match calls.remove(&seqid) {
                Some(call) => {
                    let _ = call.reply.send(outcome);
                }
                None => warn!("{}", Error::CallNotFound(seqid)),
            },
            Command::Cancel { seqid } => {
                let Some(call) = calls.remove(&seqid) else {
                    trace!(seqid, "Call already settled; not cancelling");
                    continue;
                };
                let _ = call.reply.send(Err(Error::CallCanceled {
                    seqid,
                    method: call.method.clone(),
                }));

                let encoder = encoder.clone();
                tokio::spawn(async move {
                    let cancel = RpcMessage::Cancel {
                        seqid,
                        method: call.method,
                    };
                    if let Err(e) = encoder.send(&cancel).await {
                        debug!(seqid, "Failed to send cancel: {e}");
                    }
                });
            }
            Command::Abandon { seqid } => {
                calls.remove(&seqid);
            }
            Command::Close { done } => {
                closed = Some(done);
                break;
            }
        }
    }

    mailbox.close();
    while let Ok(command) = mailbox.try_recv() {
        match command {
            Command::Register { reply, .. } => {
                let _ = reply.send(Err(Error::EndOfStream));
            }
            Command::Close { done } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }

    if !calls.is_empty() {
        debug!("Failing {} outstanding calls with end of stream", calls.len());
    }
    for (_, call) in calls.drain() {
        let _ = call.reply.send(Err(Error::EndOfStream));
    }

    if let Some(done) = closed {
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::FrameCodec;
    use crate::protocol::message::{Packet, decode_packet};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedRead;

    fn dispatcher() -> (Dispatcher, FramedRead<DuplexStream, FrameCodec>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let encoder = Arc::new(MessageEncoder::new(Box::new(local), FrameCodec::new()));
        (Dispatcher::new(encoder), FramedRead::new(remote, FrameCodec::new()))
    }

    async fn next_message(wire: &mut FramedRead<DuplexStream, FrameCodec>) -> RpcMessage {
        let body = wire.next().await.unwrap().unwrap();
        match decode_packet(&body).unwrap() {
            Packet::Message(message) => message,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_settles_call() {
        let (dispatcher, mut wire) = dispatcher();
        let ctx = CancellationToken::new();

        let caller = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .call(&ctx, "math.inc", Value::Integer(7.into()))
                    .await
            })
        };

        let RpcMessage::Call { seqid, method, .. } = next_message(&mut wire).await else {
            panic!("expected call");
        };
        assert_eq!(method, "math.inc");

        dispatcher.deliver(
            seqid,
            Ok(ResponsePayload {
                seqid,
                error: None,
                result: Value::Integer(8.into()),
            }),
        );

        let payload = caller.await.unwrap().unwrap();
        assert_eq!(payload.result, Value::Integer(8.into()));
    }

    #[tokio::test]
    async fn test_cancel_settles_locally_and_notifies_peer() {
        let (dispatcher, mut wire) = dispatcher();
        let ctx = CancellationToken::new();

        let caller = {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatcher.call(&ctx, "slow.wait", Value::Null).await })
        };

        let RpcMessage::Call { seqid, .. } = next_message(&mut wire).await else {
            panic!("expected call");
        };
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(result, Err(Error::CallCanceled { seqid: s, .. }) if s == seqid);

        assert_eq!(
            next_message(&mut wire).await,
            RpcMessage::Cancel {
                seqid,
                method: "slow.wait".to_string()
            }
        );

        // A late response for the cancelled call is dropped.
        dispatcher.deliver(
            seqid,
            Ok(ResponsePayload {
                seqid,
                error: None,
                result: Value::Null,
            }),
        );
    }

    #[tokio::test]
    async fn test_response_wins_race_with_cancel() {
        let (dispatcher, mut wire) = dispatcher();
        let ctx = CancellationToken::new();

        let caller = {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatcher.call(&ctx, "race.m", Value::Null).await })
        };

        let RpcMessage::Call { seqid, .. } = next_message(&mut wire).await else {
            panic!("expected call");
        };
        dispatcher.deliver(
            seqid,
            Ok(ResponsePayload {
                seqid,
                error: None,
                result: Value::Bool(true),
            }),
        );
        ctx.cancel();

        // The response reached the actor first; the cancel finds nothing to settle.
        let payload = caller.await.unwrap().unwrap();
        assert_eq!(payload.result, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_cancel_while_writer_is_blocked() {
        // The peer never reads, so the first call's frame fills the pipe.
        let (local, _remote) = tokio::io::duplex(64);
        let encoder = Arc::new(MessageEncoder::new(Box::new(local), FrameCodec::new()));
        let dispatcher = Dispatcher::new(encoder);

        let blocked = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .call(&CancellationToken::new(), "bulk.put", Value::Bytes(vec![0; 4096]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.call(&ctx, "small.m", Value::Null),
        )
        .await
        .expect("cancelled call must settle while the writer is blocked");
        assert_matches!(result, Err(Error::CallCanceled { method, .. }) if method == "small.m");
        assert!(!blocked.is_finished());
        blocked.abort();
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (dispatcher, mut wire) = dispatcher();

        let caller = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .call(&CancellationToken::new(), "never.answered", Value::Null)
                    .await
            })
        };
        let _ = next_message(&mut wire).await;

        dispatcher.close().await;
        assert_matches!(caller.await.unwrap(), Err(Error::EndOfStream));

        let late = dispatcher
            .call(&CancellationToken::new(), "after.close", Value::Null)
            .await;
        assert_matches!(late, Err(Error::EndOfStream));
    }

    #[tokio::test]
    async fn test_dropped_call_sends_cancel() {
        let (dispatcher, mut wire) = dispatcher();
        let ctx = CancellationToken::new();

        let call = dispatcher.call(&ctx, "dropped.m", Value::Null);
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;

        let RpcMessage::Call { seqid, .. } = next_message(&mut wire).await else {
            panic!("expected call");
        };
        assert_eq!(
            next_message(&mut wire).await,
            RpcMessage::Cancel {
                seqid,
                method: "dropped.m".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_seqids_are_unique() {
        let (dispatcher, mut wire) = dispatcher();
        let ctx = CancellationToken::new();

        for _ in 0..3 {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatcher.call(&ctx, "m.m", Value::Null).await });
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let RpcMessage::Call { seqid, .. } = next_message(&mut wire).await else {
                panic!("expected call");
            };
            assert!(seen.insert(seqid));
        }
        ctx.cancel();
    }
}
