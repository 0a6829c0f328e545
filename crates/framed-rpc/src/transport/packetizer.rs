//! Reads frames off a stream and classifies them into messages.

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::error::Result;
use crate::protocol::framing::FrameCodec;
use crate::protocol::message::{Packet, decode_packet};

/// Boxed read half of a transport stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// In-order reader of packets from one stream.
pub struct Packetizer {
    frames: FramedRead<BoxedReader, FrameCodec>,
}

impl Packetizer {
    /// Wrap a read half.
    pub fn new(reader: BoxedReader, codec: FrameCodec) -> Self {
        Self {
            frames: FramedRead::new(reader, codec),
        }
    }

    /// Next packet, or `None` at end of stream.
    ///
    /// An `Err` is a framing failure; the stream must not be read further.
    /// Cancel safe.
    pub async fn next_packet(&mut self) -> Option<Result<Packet>> {
        let body = match self.frames.next().await? {
            Ok(body) => body,
            Err(e) => return Some(Err(e)),
        };
        Some(decode_packet(&body))
    }
}
