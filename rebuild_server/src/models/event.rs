//! rebuild.event: One upstream change notification and its outcome.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::events::EventType;
use crate::schema::rebuild_events;

/// Lifecycle of an event. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Initialized,
    Building,
    Complete,
    Failed,
    Skipped,
    Canceled,
}

impl EventState {
    pub const ALL: [EventState; 6] = [
        EventState::Initialized,
        EventState::Building,
        EventState::Complete,
        EventState::Failed,
        EventState::Skipped,
        EventState::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Initialized => "initialized",
            EventState::Building => "building",
            EventState::Complete => "complete",
            EventState::Failed => "failed",
            EventState::Skipped => "skipped",
            EventState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventState::Complete | EventState::Failed | EventState::Skipped | EventState::Canceled
        )
    }

    /// Whether `self -> next` is a legal move. Re-entering the same
    /// non-terminal state is allowed so the reason can be refreshed.
    pub fn can_transition_to(&self, next: EventState) -> bool {
        match self {
            EventState::Initialized => true,
            EventState::Building => next != EventState::Initialized,
            _ => false,
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown event state: {s}"))
    }
}

/// How a single handler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerOutcomeKind {
    Planned,
    Declined,
    Forwarded,
    Retryable,
    Failed,
}

/// Ledger entry recorded against an event for every handler that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub handler: String,
    pub outcome: HandlerOutcomeKind,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl HandlerResult {
    pub fn new(handler: &str, outcome: HandlerOutcomeKind, detail: impl Into<String>) -> Self {
        Self {
            handler: handler.to_string(),
            outcome,
            detail: detail.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub message_id: String,
    pub event_type: EventType,
    /// Upstream key explaining why the event exists (e.g. an advisory id).
    pub search_key: String,
    pub state: EventState,
    pub state_reason: String,
    pub dry_run: bool,
    pub requester: Option<String>,
    pub handler_results: Vec<HandlerResult>,
    pub time_created: DateTime<Utc>,
    pub time_done: Option<DateTime<Utc>>,
}

/// Input to `Store::create_event`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub message_id: String,
    pub event_type: EventType,
    pub search_key: String,
    pub dry_run: bool,
    pub requester: Option<String>,
}

/// Query over stored events. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub search_key: Option<String>,
    pub state: Option<EventState>,
    pub event_type: Option<EventType>,
    /// Matches events owning a build whose original or rebuilt NVR equals this.
    pub nvr: Option<String>,
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn in_state(state: EventState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

// ── Database rows ──

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = rebuild_events)]
pub struct EventRecord {
    pub id: i64,
    pub message_id: String,
    pub event_type: String,
    pub search_key: String,
    pub state: String,
    pub state_reason: String,
    pub dry_run: bool,
    pub requester: Option<String>,
    pub handler_results: serde_json::Value,
    pub time_created: DateTime<Utc>,
    pub time_done: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rebuild_events)]
pub struct NewEventRecord {
    pub message_id: String,
    pub event_type: String,
    pub search_key: String,
    pub state: String,
    pub state_reason: String,
    pub dry_run: bool,
    pub requester: Option<String>,
    pub handler_results: serde_json::Value,
    pub time_created: DateTime<Utc>,
}

impl From<&NewEvent> for NewEventRecord {
    fn from(new: &NewEvent) -> Self {
        Self {
            message_id: new.message_id.clone(),
            event_type: new.event_type.as_str().to_string(),
            search_key: new.search_key.clone(),
            state: EventState::Initialized.as_str().to_string(),
            state_reason: String::new(),
            dry_run: new.dry_run,
            requester: new.requester.clone(),
            handler_results: serde_json::Value::Array(Vec::new()),
            time_created: Utc::now(),
        }
    }
}

impl TryFrom<EventRecord> for Event {
    type Error = StoreError;

    fn try_from(row: EventRecord) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            message_id: row.message_id,
            event_type: row.event_type.parse().map_err(StoreError::corrupt)?,
            search_key: row.search_key,
            state: row.state.parse().map_err(StoreError::corrupt)?,
            state_reason: row.state_reason,
            dry_run: row.dry_run,
            requester: row.requester,
            handler_results: serde_json::from_value(row.handler_results)
                .map_err(StoreError::corrupt)?,
            time_created: row.time_created,
            time_done: row.time_done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for state in EventState::ALL.into_iter().filter(EventState::is_terminal) {
            for next in EventState::ALL {
                assert!(!state.can_transition_to(next), "{state} -> {next}");
            }
        }
    }

    #[test]
    fn building_never_returns_to_initialized() {
        assert!(!EventState::Building.can_transition_to(EventState::Initialized));
        assert!(EventState::Building.can_transition_to(EventState::Building));
        assert!(EventState::Building.can_transition_to(EventState::Complete));
        assert!(EventState::Initialized.can_transition_to(EventState::Skipped));
    }

    #[test]
    fn state_strings_parse_back() {
        for state in EventState::ALL {
            assert_eq!(state.as_str().parse::<EventState>().unwrap(), state);
        }
        assert!("done".parse::<EventState>().is_err());
    }
}
