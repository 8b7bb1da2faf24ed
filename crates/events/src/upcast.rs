//! Event schema evolution (upcasting).
//!
//! Every stored event carries `(event_type, schema_revision)`. Before any
//! aggregate or handler sees an event, the registry walks it forward one step at
//! a time (1 → 2 → 3 …) until it reaches the revision the code writes today.
//! Steps are plain functions between typed revision structs, so a chain is a
//! composition of total, deterministic conversions.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::EventEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpcastError {
    #[error("no upcaster for {event_type} at revision {revision}")]
    MissingStep { event_type: String, revision: u32 },

    #[error("{event_type} revision {revision} is newer than the current revision {current}")]
    FutureRevision {
        event_type: String,
        revision: u32,
        current: u32,
    },

    #[error("malformed {event_type} payload at revision {revision}: {reason}")]
    Malformed {
        event_type: String,
        revision: u32,
        reason: String,
    },
}

type Step = Box<dyn Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Registry of upcasting steps, keyed by `(event_type, from_revision)`.
///
/// Event types without a declared current revision pass through untouched.
#[derive(Default)]
pub struct Upcasters {
    current: HashMap<String, u32>,
    steps: HashMap<(String, u32), Step>,
}

impl core::fmt::Debug for Upcasters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut steps: Vec<_> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("Upcasters")
            .field("current", &self.current)
            .field("steps", &steps)
            .finish()
    }
}

impl Upcasters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the revision the code currently writes for an event type.
    pub fn declare_current(&mut self, event_type: &str, revision: u32) -> &mut Self {
        self.current.insert(event_type.to_string(), revision);
        self
    }

    /// Register the step `from → from + 1` between two typed revisions.
    pub fn register<From, To>(
        &mut self,
        event_type: &str,
        from_revision: u32,
        step: fn(From) -> To,
    ) -> &mut Self
    where
        From: DeserializeOwned + 'static,
        To: Serialize + 'static,
    {
        let boxed: Step = Box::new(move |payload| {
            let old: From = serde_json::from_value(payload).map_err(|e| e.to_string())?;
            serde_json::to_value(step(old)).map_err(|e| e.to_string())
        });
        self.steps.insert((event_type.to_string(), from_revision), boxed);
        self
    }

    pub fn current_revision(&self, event_type: &str) -> Option<u32> {
        self.current.get(event_type).copied()
    }

    /// Walk a payload forward to the current revision.
    pub fn upcast(
        &self,
        event_type: &str,
        revision: u32,
        payload: JsonValue,
    ) -> Result<(u32, JsonValue), UpcastError> {
        let Some(current) = self.current_revision(event_type) else {
            return Ok((revision, payload));
        };
        if revision > current {
            return Err(UpcastError::FutureRevision {
                event_type: event_type.to_string(),
                revision,
                current,
            });
        }

        let mut revision = revision;
        let mut payload = payload;
        while revision < current {
            let step = self
                .steps
                .get(&(event_type.to_string(), revision))
                .ok_or_else(|| UpcastError::MissingStep {
                    event_type: event_type.to_string(),
                    revision,
                })?;
            payload = step(payload).map_err(|reason| UpcastError::Malformed {
                event_type: event_type.to_string(),
                revision,
                reason,
            })?;
            revision += 1;
        }

        Ok((revision, payload))
    }

    /// Upcast a whole envelope, rewriting its revision.
    pub fn upcast_envelope(
        &self,
        envelope: EventEnvelope<JsonValue>,
    ) -> Result<EventEnvelope<JsonValue>, UpcastError> {
        let (mut meta, payload) = envelope.into_parts();
        let (revision, payload) = self.upcast(&meta.event_type, meta.schema_revision, payload)?;
        meta.schema_revision = revision;
        Ok(EventEnvelope::new(meta, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct V1 {
        name: String,
    }

    #[derive(Serialize, Deserialize)]
    struct V2 {
        name: String,
        tags: Vec<String>,
    }

    #[derive(Serialize)]
    struct V3 {
        name: String,
        tags: Vec<String>,
        archived: bool,
    }

    fn v1_to_v2(v: V1) -> V2 {
        V2 {
            name: v.name,
            tags: vec![],
        }
    }

    fn v2_to_v3(v: V2) -> V3 {
        V3 {
            name: v.name,
            tags: v.tags,
            archived: false,
        }
    }

    fn registry() -> Upcasters {
        let mut up = Upcasters::new();
        up.declare_current("thing.made", 3)
            .register("thing.made", 1, v1_to_v2)
            .register("thing.made", 2, v2_to_v3);
        up
    }

    #[test]
    fn chains_steps_up_to_current() {
        let (rev, payload) = registry().upcast("thing.made", 1, json!({"name": "a"})).unwrap();
        assert_eq!(rev, 3);
        assert_eq!(payload, json!({"name": "a", "tags": [], "archived": false}));
    }

    #[test]
    fn current_revision_is_untouched() {
        let original = json!({"name": "a", "tags": ["x"], "archived": true});
        let (rev, payload) = registry().upcast("thing.made", 3, original.clone()).unwrap();
        assert_eq!(rev, 3);
        assert_eq!(payload, original);
    }

    #[test]
    fn undeclared_types_pass_through() {
        let (rev, payload) = registry().upcast("other.event", 7, json!({"k": 1})).unwrap();
        assert_eq!(rev, 7);
        assert_eq!(payload, json!({"k": 1}));
    }

    #[test]
    fn missing_and_future_revisions_are_errors() {
        let mut up = Upcasters::new();
        up.declare_current("thing.made", 3).register("thing.made", 2, v2_to_v3);

        let err = up.upcast("thing.made", 1, json!({"name": "a"})).unwrap_err();
        assert_eq!(
            err,
            UpcastError::MissingStep {
                event_type: "thing.made".to_string(),
                revision: 1
            }
        );

        let err = up.upcast("thing.made", 4, json!({})).unwrap_err();
        assert!(matches!(err, UpcastError::FutureRevision { current: 3, .. }));
    }

    #[test]
    fn malformed_payloads_are_reported() {
        let err = registry().upcast("thing.made", 1, json!({"nom": 1})).unwrap_err();
        assert!(matches!(err, UpcastError::Malformed { revision: 1, .. }));
    }
}
