//! State aggregator: applies task-state notifications from build systems.
//!
//! Notifications are keyed by build system and task id. A notification can
//! beat the submission it reports on: its task id is then held for a while
//! and applied by the scheduler once the submission is recorded. Unknown
//! task ids are dropped when the hold window runs out, and a notification
//! for a build that is already terminal changes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::RebuildConfig;
use crate::error::RebuildError;
use crate::events::notification::{TaskNotification, TaskOutcome};
use crate::models::build::{ArtifactBuild, BuildState, BuildTransition};
use crate::services::event_service::EventService;
use crate::services::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationResult {
    Applied(ArtifactBuild),
    /// The build was already terminal.
    Duplicate(ArtifactBuild),
    /// No build carries this task id yet; held for the submission path.
    Held,
    /// No build carries this task id.
    Unknown,
}

#[derive(Clone)]
pub struct Aggregator {
    events: EventService,
    scheduler: Scheduler,
    config: Arc<RebuildConfig>,
}

impl Aggregator {
    pub fn new(events: EventService, scheduler: Scheduler, config: Arc<RebuildConfig>) -> Self {
        Self {
            events,
            scheduler,
            config,
        }
    }

    pub async fn apply(
        &self,
        notification: &TaskNotification,
    ) -> Result<NotificationResult, RebuildError> {
        let artifact_type = notification.artifact_type;
        let task_id = notification.task_id.as_str();
        let store = self.events.store();
        let mut current = match store.build_by_task_id(artifact_type, task_id).await? {
            Some(build) => build,
            None if self.config.notification_hold.is_zero() => {
                tracing::warn!(%artifact_type, task_id, "Dropping notification for unknown task");
                crate::metrics::notification("unknown");
                return Ok(NotificationResult::Unknown);
            }
            None => {
                self.scheduler.hold_notification(notification.clone());
                // The submission may have been recorded since the lookup.
                let recorded = store.build_by_task_id(artifact_type, task_id).await?;
                match recorded {
                    Some(build) if self.scheduler.take_held(artifact_type, task_id).is_some() => build,
                    _ => {
                        tracing::info!(
                            %artifact_type,
                            task_id,
                            "Holding notification for a task not recorded yet"
                        );
                        crate::metrics::notification("held");
                        return Ok(NotificationResult::Held);
                    }
                }
            }
        };

        let target = notification.outcome.build_state();
        loop {
            if current.state.is_terminal() {
                tracing::debug!(
                    build_id = current.id,
                    task_id,
                    state = %current.state,
                    "Build already terminal, ignoring notification"
                );
                crate::metrics::notification("duplicate");
                return Ok(NotificationResult::Duplicate(current));
            }

            let transition =
                BuildTransition::to(target, notification.reason()).completed_at(Utc::now());
            match self.events.transition_build(&current, transition).await? {
                Some(updated) => {
                    crate::metrics::notification("applied");
                    self.scheduler.on_build_terminal(&updated).await?;
                    return Ok(NotificationResult::Applied(updated));
                }
                None => match self.events.get_build(current.id).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(NotificationResult::Unknown),
                },
            }
        }
    }

    /// Fail every build that has been in BUILD longer than the configured
    /// horizon, exactly as if the build system had reported a failure.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize, RebuildError> {
        let horizon = self.config.build_timeout;
        let cutoff = now
            - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::days(1));
        let stale = self
            .events
            .store()
            .builds_submitted_before(cutoff)
            .await?;

        let mut failed = 0;
        for build in stale {
            if build.state != BuildState::Build {
                continue;
            }
            let Some(task_id) = build.task_id.clone() else {
                continue;
            };
            tracing::warn!(build_id = build.id, task_id = %task_id, "Build timed out");
            let notification =
                TaskNotification::new(build.artifact_type, task_id, TaskOutcome::Failed)
                    .with_reason(format!("Build timed out after {} seconds.", horizon.as_secs()));
            if let NotificationResult::Applied(_) = self.apply(&notification).await? {
                failed += 1;
            }
        }
        Ok(failed)
    }
}
