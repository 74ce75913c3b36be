//! Typed inbound change-events.
//!
//! Every bus message is parsed into an [`InboundMessage`] whose payload is a
//! closed set of variants. The variant tag is persisted as the event type.

pub mod notification;

use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactRef;

/// Persisted tag of an [`EventPayload`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AdvisorySigned,
    ModuleStateChanged,
    ContentChanged,
    ManualRebuild,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::AdvisorySigned,
        EventType::ModuleStateChanged,
        EventType::ContentChanged,
        EventType::ManualRebuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AdvisorySigned => "advisory_signed",
            EventType::ModuleStateChanged => "module_state_changed",
            EventType::ContentChanged => "content_changed",
            EventType::ManualRebuild => "manual_rebuild",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// Module build states as reported by the module build service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleBuildState {
    Init,
    Wait,
    Build,
    Done,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An advisory's content was signed and is ready to ship.
    AdvisorySigned {
        advisory_id: String,
        #[serde(default)]
        advisory_name: Option<String>,
        #[serde(default)]
        content_types: Vec<String>,
    },
    /// A module build changed state in the module build service.
    ModuleStateChanged {
        name: String,
        stream: String,
        version: String,
        build_id: i64,
        state: ModuleBuildState,
    },
    /// Some content was rebuilt or updated; its dependents need rebuilding.
    ContentChanged {
        search_key: String,
        artifacts: Vec<ArtifactRef>,
    },
    /// Synthesized by the manual-trigger entry point.
    ManualRebuild {
        #[serde(default)]
        search_key: Option<String>,
        #[serde(default)]
        artifacts: Vec<ArtifactRef>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::AdvisorySigned { .. } => EventType::AdvisorySigned,
            EventPayload::ModuleStateChanged { .. } => EventType::ModuleStateChanged,
            EventPayload::ContentChanged { .. } => EventType::ContentChanged,
            EventPayload::ManualRebuild { .. } => EventType::ManualRebuild,
        }
    }

    pub fn search_key(&self) -> String {
        match self {
            EventPayload::AdvisorySigned { advisory_id, .. } => advisory_id.clone(),
            EventPayload::ModuleStateChanged { build_id, .. } => build_id.to_string(),
            EventPayload::ContentChanged { search_key, .. } => search_key.clone(),
            EventPayload::ManualRebuild {
                search_key,
                artifacts,
            } => search_key.clone().unwrap_or_else(|| {
                artifacts
                    .iter()
                    .map(|a| a.nvr.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            }),
        }
    }
}

/// One message from the bus, already parsed. `msg_id` is stable across
/// redeliveries of the same upstream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub msg_id: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub requester: Option<String>,
    pub event: EventPayload,
}

impl InboundMessage {
    pub fn new(msg_id: impl Into<String>, event: EventPayload) -> Self {
        Self {
            msg_id: msg_id.into(),
            dry_run: false,
            requester: None,
            event,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_bus_message() {
        let raw = r#"{
            "msg_id": "2024-abc",
            "event": {"type": "advisory_signed", "advisory_id": "RHSA-2024:0001", "content_types": ["rpm"]}
        }"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(!msg.dry_run);
        assert_eq!(msg.event.event_type(), EventType::AdvisorySigned);
        assert_eq!(msg.event.search_key(), "RHSA-2024:0001");
    }

    #[test]
    fn module_events_are_keyed_by_build_id() {
        let payload = EventPayload::ModuleStateChanged {
            name: "nodejs".into(),
            stream: "18".into(),
            version: "20240101".into(),
            build_id: 4242,
            state: ModuleBuildState::Ready,
        };
        assert_eq!(payload.search_key(), "4242");
    }

    #[test]
    fn manual_rebuild_without_key_uses_artifact_nvrs() {
        let payload = EventPayload::ManualRebuild {
            search_key: None,
            artifacts: vec![
                ArtifactRef::new("a", crate::models::ArtifactType::Image, "a-1-1"),
                ArtifactRef::new("b", crate::models::ArtifactType::Image, "b-1-1"),
            ],
        };
        assert_eq!(payload.search_key(), "a-1-1,b-1-1");
    }
}
