use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **revisioned** (schema evolution goes through the upcaster registry)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "library.book_added").
    fn event_type(&self) -> &'static str;

    /// Schema revision of this event type as written today.
    fn schema_revision(&self) -> u32;

    /// When the event occurred (business time, carried in from the command).
    fn occurred_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {event_type}: {reason}")]
    Encode { event_type: String, reason: String },

    #[error("failed to decode {event_type}: {reason}")]
    Decode { event_type: String, reason: String },
}

/// Serialize an event into the payload stored in the log.
///
/// Domain event enums are adjacently tagged (`#[serde(tag = "type", content = "data")]`)
/// with the variant renamed to its `event_type()`. Only the `data` part is stored;
/// the type travels in its own column so upcasters can work on bare payloads.
pub fn encode_payload<E>(event: &E) -> Result<JsonValue, CodecError>
where
    E: Event + Serialize,
{
    let event_type = event.event_type();
    let tagged = serde_json::to_value(event).map_err(|e| CodecError::Encode {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    })?;

    match tagged {
        JsonValue::Object(mut obj) => Ok(obj.remove("data").unwrap_or(JsonValue::Null)),
        other => Err(CodecError::Encode {
            event_type: event_type.to_string(),
            reason: format!("expected an adjacently tagged object, got {other}"),
        }),
    }
}

/// Rebuild a typed event from its stored type name and (current-revision) payload.
pub fn decode_payload<E>(event_type: &str, payload: &JsonValue) -> Result<E, CodecError>
where
    E: DeserializeOwned,
{
    serde_json::from_value(json!({ "type": event_type, "data": payload })).map_err(|e| {
        CodecError::Decode {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum Ping {
        #[serde(rename = "test.pinged")]
        Pinged { n: u32, at: DateTime<Utc> },
    }

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn schema_revision(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            match self {
                Ping::Pinged { at, .. } => *at,
            }
        }
    }

    #[test]
    fn stored_payload_excludes_the_type_tag() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let payload = encode_payload(&Ping::Pinged { n: 7, at }).unwrap();
        assert_eq!(payload["n"], 7);
        assert!(payload.get("type").is_none());

        let back: Ping = decode_payload("test.pinged", &payload).unwrap();
        assert_eq!(back, Ping::Pinged { n: 7, at });
    }

    #[test]
    fn decoding_an_unknown_type_fails() {
        let err = decode_payload::<Ping>("test.unknown", &json!({"n": 1})).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
