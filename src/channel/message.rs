//! Protocol messages exchanged with a worker process.

use std::sync::Arc;

/// Payload kind of a framed message. The numeric tag is what goes on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Execute,
    PutVariable,
    GetVariable,
    ListVariables,
    AutoComplete,
    Shutdown,
    /// Startup handshake sent by the worker once it is ready to serve.
    Ready,
    /// Successful response, payload depends on the request kind.
    Success,
    /// Request-level failure, payload carries a message.
    Failure,
    /// Worker-pushed log line, not correlated to any request.
    Output,
}

impl MessageKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Execute => 0x01,
            Self::PutVariable => 0x02,
            Self::GetVariable => 0x03,
            Self::ListVariables => 0x04,
            Self::AutoComplete => 0x05,
            Self::Shutdown => 0x06,
            Self::Ready => 0x07,
            Self::Success => 0x10,
            Self::Failure => 0x11,
            Self::Output => 0x12,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Execute),
            0x02 => Some(Self::PutVariable),
            0x03 => Some(Self::GetVariable),
            0x04 => Some(Self::ListVariables),
            0x05 => Some(Self::AutoComplete),
            0x06 => Some(Self::Shutdown),
            0x07 => Some(Self::Ready),
            0x10 => Some(Self::Success),
            0x11 => Some(Self::Failure),
            0x12 => Some(Self::Output),
            _ => None,
        }
    }

    /// Whether this kind answers a request (and therefore carries the
    /// request's correlation id).
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// One framed message: correlation id, kind and raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: u32, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { id, kind, payload }
    }

    /// The loop-termination sentinel. Detected by identity (`Arc::ptr_eq`)
    /// only: a structurally identical message read off the wire must never
    /// terminate a loop, so content comparison is deliberately not used.
    pub fn poison() -> Arc<Self> {
        Arc::new(Self {
            id: 0,
            kind: MessageKind::Shutdown,
            payload: Vec::new(),
        })
    }
}

/// Identity comparison against a channel's poison sentinel.
pub fn is_poison(message: &Arc<Message>, poison: &Arc<Message>) -> bool {
    Arc::ptr_eq(message, poison)
}
