//! Asynchronous notifications: task-state reports coming in from build
//! systems and state-change notifications going out to the bus.

use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactType;
use crate::models::build::{ArtifactBuild, BuildState};
use crate::models::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl TaskOutcome {
    pub fn build_state(&self) -> BuildState {
        match self {
            TaskOutcome::Succeeded => BuildState::Done,
            TaskOutcome::Failed => BuildState::Failed,
            TaskOutcome::Canceled => BuildState::Canceled,
        }
    }

    pub fn default_reason(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "Built successfully.",
            TaskOutcome::Failed => "Build failed in the build system.",
            TaskOutcome::Canceled => "Build was canceled in the build system.",
        }
    }
}

/// A terminal task-state report. Task ids are only unique within one build
/// system, so the report names the artifact type whose system sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub artifact_type: ArtifactType,
    pub task_id: String,
    pub outcome: TaskOutcome,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TaskNotification {
    pub fn new(artifact_type: ArtifactType, task_id: impl Into<String>, outcome: TaskOutcome) -> Self {
        Self {
            artifact_type,
            task_id: task_id.into(),
            outcome,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| self.outcome.default_reason().to_string())
    }
}

/// Published on every event or build transition. The payload is the
/// serialized record after the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum StateChange {
    Event(Event),
    Build(ArtifactBuild),
}

impl StateChange {
    pub fn topic(&self) -> &'static str {
        match self {
            StateChange::Event(_) => "rebuild.event.state.changed",
            StateChange::Build(_) => "rebuild.build.state.changed",
        }
    }
}
