use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;

/// One opaque stream frame.
///
/// The relay never looks inside a payload. It only remembers whether the
/// producer sent it as a text or binary message so subscribers receive the
/// same message kind. Both variants are reference-counted, so cloning a
/// payload for every subscriber never copies the frame bytes.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Utf8Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Extract a payload from a transport message.
    ///
    /// Returns `None` for control frames (ping, pong, close).
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_str().as_bytes(),
            Self::Binary(data) => data,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.as_str() == b.as_str(),
            (Self::Binary(a), Self::Binary(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Payload {}
