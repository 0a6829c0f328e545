//! Protocol layer for the RPC framework.
//!
//! This module contains the wire-level definitions:
//! - Length-prefixed framing
//! - CBOR value conversion
//! - The four message kinds and their array layout

pub mod codec;
pub mod framing;
pub mod message;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};
pub use message::{MessageType, Packet, RpcMessage, SeqId, decode_packet};
