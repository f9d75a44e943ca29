#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Maximum allowed chat message bytes on the send path.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024;

/// Event emitted once per stream, carrying the allocated connection id.
pub const EVENT_CONNECTED: &str = "connected";
/// Liveness frame written on a fixed interval while the stream is open.
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// Room fan-out frame.
pub const EVENT_NEW_MESSAGE: &str = "new_message";
/// Operational announcement to every live connection.
pub const EVENT_ANNOUNCEMENT: &str = "announcement";

/// Event type identifier with a strict character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for EventType {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_event_type(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// One server-push frame: a named event and its JSON payload. Frames are
/// rendered to the wire as `event:`/`data:` lines by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event_type: EventType,
    pub data: serde_json::Value,
}

impl EventFrame {
    /// Builds a frame, validating the event-type identifier.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidEventType`] for identifiers outside
    /// the allowlist.
    pub fn new(event_type: &str, data: serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            event_type: EventType::try_from(event_type)?,
            data,
        })
    }
}

/// Validates an inbound message body at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError::OversizedMessage`] past [`MAX_MESSAGE_BYTES`]
/// and [`ProtocolError::EmptyMessage`] for a zero-length body.
pub fn validate_message(message: &str) -> Result<(), ProtocolError> {
    if message.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::OversizedMessage {
            max: MAX_MESSAGE_BYTES,
            actual: message.len(),
        });
    }
    Ok(())
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedMessage { max: usize, actual: usize },
    #[error("message is empty")]
    EmptyMessage,
    #[error("invalid event type")]
    InvalidEventType,
}

#[cfg(test)]
mod tests {
    use super::{
        validate_message, EventFrame, EventType, ProtocolError, EVENT_NEW_MESSAGE,
        MAX_MESSAGE_BYTES,
    };

    #[test]
    fn event_type_accepts_valid_identifier() {
        let event_type = EventType::try_from(String::from(EVENT_NEW_MESSAGE)).unwrap();
        assert_eq!(event_type.as_str(), "new_message");
    }

    #[test]
    fn event_type_rejects_invalid_identifier() {
        let error = EventType::try_from(String::from("new-message")).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidEventType);
    }

    #[test]
    fn frame_round_trips_through_json() {
        let frame = EventFrame::new("connected", serde_json::json!({"connection_id": "abc"}))
            .unwrap();
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: EventFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn message_bounds_are_enforced() {
        assert_eq!(validate_message(""), Err(ProtocolError::EmptyMessage));
        assert!(validate_message("hello").is_ok());
        let oversized = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert_eq!(
            validate_message(&oversized),
            Err(ProtocolError::OversizedMessage {
                max: MAX_MESSAGE_BYTES,
                actual: MAX_MESSAGE_BYTES + 1,
            })
        );
    }
}
