use serde_json::Value as JsonValue;
use thiserror::Error;

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **tagged** by a stable type name stored next to the payload
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "StockAdded").
    fn event_type(&self) -> &'static str;

    /// Encode the variant-specific payload (without the type tag).
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error>;
}

/// Decoding of a stored `(event_type, payload)` pair back into a typed event.
pub trait DecodeEvent: Event + Sized {
    fn decode(event_type: &str, payload: &JsonValue) -> Result<Self, DecodeError>;
}

/// Failure to turn a stored record into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The type tag is not known to this decoder.
    #[error("unknown event type '{0}'")]
    UnknownType(String),

    /// The type tag is known but the payload does not have the expected shape.
    #[error("malformed '{event_type}' payload: {reason}")]
    Malformed { event_type: String, reason: String },
}

impl DecodeError {
    pub fn malformed(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }
}
