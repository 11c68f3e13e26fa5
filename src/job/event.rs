// src/job/event.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stop,
    Error,
    Log,
}

/// A single fine-grained event reported for a job.
///
/// For playbooks `event_name` is the remote identifier (e.g. `site.yml`);
/// local jobs use their own job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_name: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EventRecord {
    pub fn new(event_name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_name: event_name.into(),
            kind,
            payload: None,
        }
    }

    pub fn start(event_name: impl Into<String>) -> Self {
        Self::new(event_name, EventKind::Start)
    }

    pub fn stop(event_name: impl Into<String>) -> Self {
        Self::new(event_name, EventKind::Stop)
    }

    pub fn error(event_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            payload: Some(Value::String(message.into())),
            ..Self::new(event_name, EventKind::Error)
        }
    }

    pub fn log(event_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            payload: Some(Value::String(text.into())),
            ..Self::new(event_name, EventKind::Log)
        }
    }

    /// Payload as text, if it is a JSON string.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_ref().and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_type_tag() {
        let json = serde_json::to_value(EventRecord::start("site.yml")).unwrap();
        assert_eq!(json, serde_json::json!({"event_name": "site.yml", "type": "start"}));

        let parsed: EventRecord =
            serde_json::from_str(r#"{"event_name":"wipe.yml","type":"error","payload":"boom"}"#)
                .unwrap();
        assert_eq!(parsed.kind, EventKind::Error);
        assert_eq!(parsed.text(), Some("boom"));
    }
}
