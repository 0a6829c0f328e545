//! Serialized outbound writes.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::framing::FrameCodec;
use crate::protocol::message::RpcMessage;

/// Boxed write half of a transport stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Single writer for a transport; every send holds the sink lock for one frame.
pub struct MessageEncoder {
    sink: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl MessageEncoder {
    /// Wrap a write half.
    pub fn new(writer: BoxedWriter, codec: FrameCodec) -> Self {
        Self {
            sink: Mutex::new(Some(FramedWrite::new(writer, codec))),
        }
    }

    /// Encode and flush one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfStream`] once the encoder is closed, or the
    /// encoding/I/O error.
    pub async fn send(&self, message: &RpcMessage) -> Result<()> {
        let body = message.encode()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::EndOfStream)?;
        trace!(kind = %message.message_type(), bytes = body.len(), "Sending frame");
        sink.send(body).await
    }

    /// Flush and shut down the write half. Later sends fail with end of stream.
    pub async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                debug!("Error closing writer: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Packet, decode_packet};
    use ciborium::Value;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_send_then_close() {
        let (local, remote) = tokio::io::duplex(1024);
        let encoder = MessageEncoder::new(Box::new(local), FrameCodec::new());

        let notify = RpcMessage::Notify {
            method: "log.line".to_string(),
            arg: Value::Text("hello".into()),
        };
        encoder.send(&notify).await.unwrap();
        encoder.close().await;

        assert!(matches!(encoder.send(&notify).await, Err(Error::EndOfStream)));

        let mut frames = FramedRead::new(remote, FrameCodec::new());
        let body = frames.next().await.unwrap().unwrap();
        assert_eq!(decode_packet(&body).unwrap(), Packet::Message(notify));
        assert!(frames.next().await.is_none());
    }
}
