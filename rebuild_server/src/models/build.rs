//! rebuild.artifact_build: One planned or submitted rebuild of an artifact.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::artifact::ArtifactType;
use crate::schema::rebuild_artifact_builds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Planned,
    Build,
    Done,
    Failed,
    Canceled,
}

impl BuildState {
    pub const ALL: [BuildState; 5] = [
        BuildState::Planned,
        BuildState::Build,
        BuildState::Done,
        BuildState::Failed,
        BuildState::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Planned => "planned",
            BuildState::Build => "build",
            BuildState::Done => "done",
            BuildState::Failed => "failed",
            BuildState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Done | BuildState::Failed | BuildState::Canceled
        )
    }

    /// PLANNED may stay PLANNED (retry bookkeeping) or jump straight to a
    /// terminal state (dry run, propagation, exhausted retries). BUILD only
    /// moves to a terminal state. Terminal builds are immutable.
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        match self {
            BuildState::Planned => true,
            BuildState::Build => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown build state: {s}"))
    }
}

/// Why an artifact ended up in the rebuild tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    DirectlyAffected,
    Dependency,
}

impl RebuildReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildReason::DirectlyAffected => "directly_affected",
            RebuildReason::Dependency => "dependency",
        }
    }
}

impl std::fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RebuildReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directly_affected" => Ok(RebuildReason::DirectlyAffected),
            "dependency" => Ok(RebuildReason::Dependency),
            other => Err(format!("unknown rebuild reason: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBuild {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub original_nvr: String,
    pub rebuilt_nvr: Option<String>,
    pub state: BuildState,
    pub state_reason: String,
    pub rebuild_reason: RebuildReason,
    /// Parent build that must reach DONE before this one is submitted.
    pub dep_on: Option<i64>,
    /// Opaque, build-system specific argument bag produced by the planner.
    pub build_args: serde_json::Value,
    pub task_id: Option<String>,
    pub retry_count: i32,
    pub time_created: DateTime<Utc>,
    pub time_submitted: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

impl ArtifactBuild {
    pub fn is_root(&self) -> bool {
        self.dep_on.is_none()
    }
}

/// A build as emitted by the planner. The parent is referenced by its
/// position in the same planned batch and resolved to an id on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifactBuild {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub original_nvr: String,
    pub rebuild_reason: RebuildReason,
    pub dep_on_index: Option<usize>,
    pub build_args: serde_json::Value,
    pub state_reason: String,
}

/// Field updates applied together with a build state change. `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTransition {
    pub state: BuildState,
    pub state_reason: String,
    pub task_id: Option<String>,
    pub rebuilt_nvr: Option<String>,
    pub retry_count: Option<i32>,
    pub time_submitted: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

impl BuildTransition {
    pub fn to(state: BuildState, reason: impl Into<String>) -> Self {
        Self {
            state,
            state_reason: reason.into(),
            task_id: None,
            rebuilt_nvr: None,
            retry_count: None,
            time_submitted: None,
            time_completed: None,
        }
    }

    pub fn task(mut self, task_id: impl Into<String>, rebuilt_nvr: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.rebuilt_nvr = Some(rebuilt_nvr.into());
        self
    }

    pub fn rebuilt_nvr(mut self, nvr: impl Into<String>) -> Self {
        self.rebuilt_nvr = Some(nvr.into());
        self
    }

    pub fn retry_count(mut self, count: i32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.time_submitted = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.time_completed = Some(at);
        self
    }

    /// Applies the update to an in-memory copy.
    pub fn apply(&self, build: &mut ArtifactBuild) {
        build.state = self.state;
        build.state_reason = self.state_reason.clone();
        if let Some(task_id) = &self.task_id {
            build.task_id = Some(task_id.clone());
        }
        if let Some(nvr) = &self.rebuilt_nvr {
            build.rebuilt_nvr = Some(nvr.clone());
        }
        if let Some(count) = self.retry_count {
            build.retry_count = count;
        }
        if let Some(at) = self.time_submitted {
            build.time_submitted = Some(at);
        }
        if let Some(at) = self.time_completed {
            build.time_completed = Some(at);
        }
    }
}

// ── Database rows ──

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = rebuild_artifact_builds)]
pub struct BuildRecord {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub artifact_type: String,
    pub original_nvr: String,
    pub rebuilt_nvr: Option<String>,
    pub state: String,
    pub state_reason: String,
    pub rebuild_reason: String,
    pub dep_on_id: Option<i64>,
    pub build_args: serde_json::Value,
    pub task_id: Option<String>,
    pub retry_count: i32,
    pub time_created: DateTime<Utc>,
    pub time_submitted: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rebuild_artifact_builds)]
pub struct NewBuildRecord {
    pub event_id: i64,
    pub name: String,
    pub artifact_type: String,
    pub original_nvr: String,
    pub state: String,
    pub state_reason: String,
    pub rebuild_reason: String,
    pub dep_on_id: Option<i64>,
    pub build_args: serde_json::Value,
    pub retry_count: i32,
    pub time_created: DateTime<Utc>,
}

impl NewBuildRecord {
    pub fn new(event_id: i64, build: &NewArtifactBuild, dep_on_id: Option<i64>) -> Self {
        Self {
            event_id,
            name: build.name.clone(),
            artifact_type: build.artifact_type.as_str().to_string(),
            original_nvr: build.original_nvr.clone(),
            state: BuildState::Planned.as_str().to_string(),
            state_reason: build.state_reason.clone(),
            rebuild_reason: build.rebuild_reason.as_str().to_string(),
            dep_on_id,
            build_args: build.build_args.clone(),
            retry_count: 0,
            time_created: Utc::now(),
        }
    }
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = rebuild_artifact_builds)]
pub struct BuildChangeset {
    pub state: String,
    pub state_reason: String,
    pub task_id: Option<String>,
    pub rebuilt_nvr: Option<String>,
    pub retry_count: Option<i32>,
    pub time_submitted: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

impl From<&BuildTransition> for BuildChangeset {
    fn from(t: &BuildTransition) -> Self {
        Self {
            state: t.state.as_str().to_string(),
            state_reason: t.state_reason.clone(),
            task_id: t.task_id.clone(),
            rebuilt_nvr: t.rebuilt_nvr.clone(),
            retry_count: t.retry_count,
            time_submitted: t.time_submitted,
            time_completed: t.time_completed,
        }
    }
}

impl TryFrom<BuildRecord> for ArtifactBuild {
    type Error = StoreError;

    fn try_from(row: BuildRecord) -> Result<Self, Self::Error> {
        Ok(ArtifactBuild {
            id: row.id,
            event_id: row.event_id,
            name: row.name,
            artifact_type: row.artifact_type.parse().map_err(StoreError::corrupt)?,
            original_nvr: row.original_nvr,
            rebuilt_nvr: row.rebuilt_nvr,
            state: row.state.parse().map_err(StoreError::corrupt)?,
            state_reason: row.state_reason,
            rebuild_reason: row.rebuild_reason.parse().map_err(StoreError::corrupt)?,
            dep_on: row.dep_on_id,
            build_args: row.build_args,
            task_id: row.task_id,
            retry_count: row.retry_count,
            time_created: row.time_created,
            time_submitted: row.time_submitted,
            time_completed: row.time_completed,
        })
    }
}
