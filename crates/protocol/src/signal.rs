use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// WebSocket close codes the relay sends (RFC 6455 §7.4.1).
pub mod close_code {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Error building or decoding a signal frame.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to encode signal payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed signal frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The recognized signal names. Anything else on the wire is logged and
/// dropped by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Close,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Close => "close",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            "close" => Some(SignalKind::Close),
            _ => None,
        }
    }
}

/// One JSON message exchanged over the per-peer WebSocket:
/// `{"name": "<signal>", "payload": <arbitrary json>}`.
///
/// The payload is kept raw so it survives a relay hop byte-exact; each side
/// decodes it against the type it expects for the signal name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFrame {
    pub name: String,
    pub payload: Box<RawValue>,
}

impl SignalFrame {
    /// Build a frame from a recognized signal kind and a serializable payload.
    pub fn new<T: Serialize>(kind: SignalKind, payload: &T) -> Result<Self, SignalError> {
        let raw = serde_json::value::to_raw_value(payload).map_err(SignalError::Encode)?;
        Ok(Self {
            name: kind.as_str().to_string(),
            payload: raw,
        })
    }

    /// A frame with a `null` payload.
    pub fn empty(kind: SignalKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            payload: RawValue::from_string("null".to_string())
                .expect("null is valid JSON"),
        }
    }

    /// The recognized kind of this frame, or `None` for unknown names.
    pub fn kind(&self) -> Option<SignalKind> {
        SignalKind::from_name(&self.name)
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(SignalError::Encode)
    }

    pub fn decode(raw: &str) -> Result<Self, SignalError> {
        serde_json::from_str(raw).map_err(SignalError::Decode)
    }

    /// Decode the payload against the type expected for this signal name.
    pub fn payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, SignalError> {
        serde_json::from_str(self.payload.get()).map_err(SignalError::Decode)
    }
}

/// Payload of a `close` signal: `null` or `{code, reason}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePayload {
    pub code: u16,
    pub reason: String,
}
