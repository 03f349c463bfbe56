use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;
use strum::{Display, FromRepr};

use crate::error::{ChannelErrorKind, Error, SessionErrorKind};

/// Kind of a [`SignalingMessage`]. On the wire it is the integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageType {
    IceCandidate = 1,
    Offer = 2,
    Answer = 3,
    OfferRequest = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::from_repr(value).ok_or_else(|| format!("unknown message type {}", value))
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Envelope exchanged over the signaling channel: `{"type": <int>, "data": <raw json>}`.
/// The payload is kept verbatim and only decoded by the handler of its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "data", default)]
    payload: Option<Box<RawValue>>,
}

impl SignalingMessage {
    /// Builds a message whose payload is `payload` serialized as JSON.
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, Error> {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            kind,
            payload: Some(raw),
        })
    }

    /// Builds a message with an already encoded JSON payload, kept byte for byte.
    pub fn from_raw(kind: MessageType, payload: &str) -> Result<Self, Error> {
        let raw = RawValue::from_string(payload.to_string())?;
        Ok(Self {
            kind,
            payload: Some(raw),
        })
    }

    /// A message without payload, such as [`MessageType::OfferRequest`].
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    /// The raw JSON text of the payload, or `None` when absent or `null`.
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }

    /// Decodes the payload as the kind-specific type `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let raw = self.payload().ok_or_else(|| {
            Error::new_session(
                format!("{} message has no payload", self.kind),
                SessionErrorKind::UnexpectedPayloadError,
            )
        })?;
        let value = serde_json::from_str(raw)?;
        Ok(value)
    }

    pub fn encode(&self) -> Result<String, Error> {
        let text = serde_json::to_string(self)?;
        Ok(text)
    }

    /// Parses one inbound frame.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data).map_err(|err| {
            Error::new_channel(
                format!("invalid signaling message: {}", err),
                ChannelErrorKind::DecodeError,
            )
        })
    }
}
