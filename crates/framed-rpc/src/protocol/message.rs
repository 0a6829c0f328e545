//! Wire messages and their array encoding.

use std::fmt;
use std::vec;

use bytes::Bytes;
use ciborium::Value;
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, Error, MessageKind, Result};
use crate::protocol::codec;

/// Sequence id correlating a call with its response or cancel.
pub type SeqId = u32;

/// CBOR major type of arrays.
const MAJOR_ARRAY: u8 = 4;

/// Leading discriminator of every message array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Reply-expecting request.
    Call = 0,
    /// Reply to a call.
    Response = 1,
    /// Fire-and-forget request.
    Notify = 2,
    /// Request to abandon an in-flight call.
    Cancel = 3,
}

impl MessageType {
    /// Number of array elements a message of this type carries, tag included.
    #[must_use]
    pub const fn field_count(self) -> usize {
        match self {
            Self::Call | Self::Response => 4,
            Self::Notify | Self::Cancel => 3,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(Self::Call),
            1 => Ok(Self::Response),
            2 => Ok(Self::Notify),
            3 => Ok(Self::Cancel),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Call => "call",
            Self::Response => "response",
            Self::Notify => "notify",
            Self::Cancel => "cancel",
        })
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// `[0, seqid, method, argument]`
    Call {
        /// Sequence id.
        seqid: SeqId,
        /// Fully qualified method name.
        method: String,
        /// Argument payload.
        arg: Value,
    },
    /// `[1, seqid, error-or-null, result]`
    Response {
        /// Sequence id of the call being answered.
        seqid: SeqId,
        /// Wrapped error, `None` on success.
        error: Option<Value>,
        /// Result payload.
        result: Value,
    },
    /// `[2, method, argument]`
    Notify {
        /// Fully qualified method name.
        method: String,
        /// Argument payload.
        arg: Value,
    },
    /// `[3, seqid, method]`
    Cancel {
        /// Sequence id of the call to abandon.
        seqid: SeqId,
        /// Method name of the call to abandon.
        method: String,
    },
}

/// One decoded frame: either a message or a recoverable decode failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A well-formed message.
    Message(RpcMessage),
    /// An array whose fields had the wrong shape.
    Malformed {
        /// Sequence id, if it could be read before the failure.
        seqid: Option<SeqId>,
        /// The failure.
        error: DecodeError,
    },
}

impl RpcMessage {
    /// The discriminator of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Call { .. } => MessageType::Call,
            Self::Response { .. } => MessageType::Response,
            Self::Notify { .. } => MessageType::Notify,
            Self::Cancel { .. } => MessageType::Cancel,
        }
    }

    /// Build the array representation of this message.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let tag = Value::Integer((self.message_type() as u8).into());
        let fields = match self {
            Self::Call { seqid, method, arg } => vec![
                tag,
                Value::Integer((*seqid).into()),
                Value::Text(method.clone()),
                arg.clone(),
            ],
            Self::Response {
                seqid,
                error,
                result,
            } => vec![
                tag,
                Value::Integer((*seqid).into()),
                error.clone().unwrap_or(Value::Null),
                result.clone(),
            ],
            Self::Notify { method, arg } => vec![tag, Value::Text(method.clone()), arg.clone()],
            Self::Cancel { seqid, method } => vec![
                tag,
                Value::Integer((*seqid).into()),
                Value::Text(method.clone()),
            ],
        };
        Value::Array(fields)
    }

    /// Encode this message into a frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload cannot be serialized.
    pub fn encode(&self) -> Result<Bytes> {
        codec::encode(&self.to_value())
    }
}

/// Decode one frame body.
///
/// Framing problems (not an array, unreadable CBOR, bytes left over after
/// the array) are returned as `Err` and are fatal to the stream. Field shape
/// problems come back as [`Packet::Malformed`].
///
/// # Errors
///
/// Returns [`Error::Framing`] if the body is not a CBOR array.
pub fn decode_packet(body: &[u8]) -> Result<Packet> {
    let Some(&first) = body.first() else {
        return Err(Error::Framing("empty frame body".to_string()));
    };
    if first >> 5 != MAJOR_ARRAY {
        return Err(Error::Framing(format!(
            "frame body must be an array, got major type {}",
            first >> 5
        )));
    }

    let Value::Array(fields) = codec::decode(body)? else {
        return Err(Error::Framing("frame body is not an array".to_string()));
    };

    let mut cursor = DecodeCursor::new(fields);
    Ok(match cursor.read_message() {
        Ok(message) => Packet::Message(message),
        Err(error) => Packet::Malformed {
            seqid: cursor.seqid,
            error,
        },
    })
}

/// Owned read position over the fields of one message.
#[derive(Debug)]
pub struct DecodeCursor {
    kind: MessageKind,
    field_count: usize,
    position: usize,
    seqid: Option<SeqId>,
    fields: vec::IntoIter<Value>,
}

impl DecodeCursor {
    /// Create a cursor over the fields of one message array.
    #[must_use]
    pub fn new(fields: Vec<Value>) -> Self {
        Self {
            kind: MessageKind::Unknown,
            field_count: fields.len(),
            position: 0,
            seqid: None,
            fields: fields.into_iter(),
        }
    }

    /// Build a decode error carrying this cursor's kind and field count.
    #[must_use]
    pub fn error(&self, cause: impl Into<String>) -> DecodeError {
        DecodeError {
            kind: self.kind,
            field_count: self.field_count,
            cause: cause.into(),
        }
    }

    /// Take the next field as a raw value.
    ///
    /// # Errors
    ///
    /// Returns a decode error if no fields remain.
    pub fn next_value(&mut self, field: &'static str) -> std::result::Result<Value, DecodeError> {
        let position = self.position;
        self.position += 1;
        self.fields
            .next()
            .ok_or_else(|| self.error(format!("missing field {position} ({field})")))
    }

    /// Take the next field and convert it to `T`.
    ///
    /// # Errors
    ///
    /// Returns a decode error if no fields remain or the field has the wrong shape.
    pub fn next_field<T: DeserializeOwned>(
        &mut self,
        field: &'static str,
    ) -> std::result::Result<T, DecodeError> {
        let position = self.position;
        let value = self.next_value(field)?;
        codec::from_value(&value)
            .map_err(|cause| self.error(format!("field {position} ({field}): {cause}")))
    }

    fn read_seqid(&mut self) -> std::result::Result<SeqId, DecodeError> {
        let seqid = self.next_field::<SeqId>("seqid")?;
        self.seqid = Some(seqid);
        Ok(seqid)
    }

    fn read_message(&mut self) -> std::result::Result<RpcMessage, DecodeError> {
        let tag = self.next_field::<u8>("type")?;
        let kind = MessageType::try_from(tag)
            .map_err(|tag| self.error(format!("unknown message type {tag}")))?;
        self.kind = MessageKind::Known(kind);

        if self.field_count != kind.field_count() {
            // Still try to surface the seqid so the caller can fail the right call.
            if matches!(kind, MessageType::Call | MessageType::Response) {
                let _ = self.read_seqid();
            }
            return Err(self.error(format!("expected {} fields", kind.field_count())));
        }

        match kind {
            MessageType::Call => {
                let seqid = self.read_seqid()?;
                let method = self.next_field::<String>("method")?;
                let arg = self.next_value("argument")?;
                Ok(RpcMessage::Call { seqid, method, arg })
            }
            MessageType::Response => {
                let seqid = self.read_seqid()?;
                let error = match self.next_value("error")? {
                    Value::Null => None,
                    error => Some(error),
                };
                let result = self.next_value("result")?;
                Ok(RpcMessage::Response {
                    seqid,
                    error,
                    result,
                })
            }
            MessageType::Notify => {
                let method = self.next_field::<String>("method")?;
                let arg = self.next_value("argument")?;
                Ok(RpcMessage::Notify { method, arg })
            }
            MessageType::Cancel => {
                let seqid = self.read_seqid()?;
                let method = self.next_field::<String>("method")?;
                Ok(RpcMessage::Cancel { seqid, method })
            }
        }
    }
}
