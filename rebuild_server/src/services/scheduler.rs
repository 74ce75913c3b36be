//! Build scheduler: submits planned builds wave by wave.
//!
//! A build is submitted only once its parent is DONE. Submissions run on
//! their own detached tasks, bounded by a semaphore with one permit per build
//! in flight; dropping the caller never interrupts a submission half-way.
//! Nothing is kept in memory between waves: every decision re-reads the
//! store, so `resume` after a restart picks up where the process left off.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::clients::BuildSystems;
use crate::config::RebuildConfig;
use crate::error::RebuildError;
use crate::events::notification::TaskNotification;
use crate::models::artifact::{rebuilt_nvr, ArtifactType};
use crate::models::build::{ArtifactBuild, BuildState, BuildTransition};
use crate::models::event::{Event, EventFilter, EventState};
use crate::services::event_service::EventService;

#[derive(Clone)]
pub struct Scheduler {
    events: EventService,
    build_systems: Arc<BuildSystems>,
    config: Arc<RebuildConfig>,
    permits: Arc<Semaphore>,
    /// Notifications that arrived before their task id was recorded.
    held: Arc<Mutex<HashMap<(ArtifactType, String), (TaskNotification, Instant)>>>,
}

impl Scheduler {
    pub fn new(
        events: EventService,
        build_systems: Arc<BuildSystems>,
        config: Arc<RebuildConfig>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            events,
            build_systems,
            config,
            permits,
            held: Arc::default(),
        }
    }

    fn is_dry_run(&self, event: &Event) -> bool {
        event.dry_run || self.config.dry_run
    }

    /// Move a freshly planned event to BUILDING and submit wave 0, unless it
    /// has to wait for other events first.
    pub async fn start_event(&self, event_id: i64) -> Result<Event, RebuildError> {
        let builds = self.events.builds(event_id).await?;
        if builds.is_empty() {
            return self
                .events
                .transition(event_id, EventState::Skipped, "No artifacts need to be rebuilt.")
                .await;
        }

        let event = self
            .events
            .transition(
                event_id,
                EventState::Building,
                format!("Rebuilding {} artifact(s).", builds.len()),
            )
            .await?;
        if event.state != EventState::Building {
            return Ok(event);
        }

        let blockers = self.pending_dependencies(event_id).await?;
        if !blockers.is_empty() {
            return self
                .events
                .transition(event_id, EventState::Building, waiting_reason(&blockers))
                .await;
        }

        let roots = planned_roots(&builds);
        self.submit_wave(&event, roots).await?;
        self.settle(event_id).await?;
        self.events.require(event_id).await
    }

    /// Events this event depends on that have not finished yet.
    pub async fn pending_dependencies(&self, event_id: i64) -> Result<Vec<i64>, RebuildError> {
        let mut pending = Vec::new();
        for dep in self.events.store().event_dependencies(event_id).await? {
            match self.events.get(dep).await? {
                Some(other) if !other.state.is_terminal() => pending.push(dep),
                _ => {}
            }
        }
        Ok(pending)
    }

    /// Submit every build of `wave` concurrently. In dry run the builds finish
    /// immediately, so their children are gathered into the next wave.
    async fn submit_wave(
        &self,
        event: &Event,
        wave: Vec<ArtifactBuild>,
    ) -> Result<(), RebuildError> {
        let dry_run = self.is_dry_run(event);
        let mut wave = wave;
        let mut n = 0;
        while !wave.is_empty() {
            tracing::info!(
                event_id = event.id,
                wave = n,
                builds = wave.len(),
                dry_run,
                "Submitting wave"
            );

            let handles: Vec<_> = wave
                .drain(..)
                .map(|build| {
                    let this = self.clone();
                    tokio::spawn(async move { this.submit_one(build.id, dry_run).await })
                })
                .collect();

            let mut next = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(Ok(Some(build))) => match build.state {
                        BuildState::Done => next.extend(self.planned_children(build.id).await?),
                        BuildState::Failed | BuildState::Canceled => self.propagate(&build).await?,
                        _ => {}
                    },
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => tracing::error!(event_id = event.id, "Submission error: {e}"),
                    Err(e) => tracing::error!(event_id = event.id, "Submission task failed: {e}"),
                }
            }
            wave = next;
            n += 1;
        }
        Ok(())
    }

    async fn planned_children(&self, build_id: i64) -> Result<Vec<ArtifactBuild>, RebuildError> {
        Ok(self
            .events
            .store()
            .children_of(build_id)
            .await?
            .into_iter()
            .filter(|c| c.state == BuildState::Planned)
            .collect())
    }

    /// Submit one PLANNED build, retrying transient failures. Returns the
    /// build after its last transition, or `None` if it was no longer
    /// PLANNED (canceled or picked up elsewhere).
    pub async fn submit_one(
        &self,
        build_id: i64,
        dry_run: bool,
    ) -> Result<Option<ArtifactBuild>, RebuildError> {
        let max_retries = self.config.max_retries as i32;
        loop {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RebuildError::Shutdown)?;
            crate::metrics::submissions_in_flight(
                self.config
                    .max_concurrent
                    .saturating_sub(self.permits.available_permits()),
            );

            let Some(build) = self.events.get_build(build_id).await? else {
                return Ok(None);
            };
            if build.state != BuildState::Planned {
                return Ok(None);
            }

            if dry_run {
                let now = Utc::now();
                crate::metrics::submission("dry_run", 0);
                let transition = BuildTransition::to(BuildState::Done, "Dry run: build not submitted.")
                    .rebuilt_nvr(rebuilt_nvr(&build.original_nvr, now))
                    .submitted_at(now)
                    .completed_at(now);
                return self.events.transition_build(&build, transition).await;
            }

            let Some(system) = self.build_systems.get(build.artifact_type) else {
                let transition = BuildTransition::to(
                    BuildState::Failed,
                    format!("No build system configured for {} artifacts.", build.artifact_type),
                )
                .completed_at(Utc::now());
                return self.events.transition_build(&build, transition).await;
            };

            let started = Instant::now();
            let result = system.submit_build(&build, &build.build_args).await;
            let elapsed = started.elapsed().as_millis() as u64;
            drop(permit);

            let error = match result {
                Ok(task) => {
                    crate::metrics::submission("ok", elapsed);
                    let now = Utc::now();
                    let nvr = task
                        .rebuilt_nvr
                        .clone()
                        .unwrap_or_else(|| rebuilt_nvr(&build.original_nvr, now));
                    let transition = BuildTransition::to(
                        BuildState::Build,
                        format!("Submitted as task {}.", task.task_id),
                    )
                    .task(task.task_id.clone(), nvr)
                    .submitted_at(now);

                    let Some(submitted) = self.events.transition_build(&build, transition).await?
                    else {
                        // Canceled while the submission was in flight.
                        tracing::warn!(
                            build_id,
                            task_id = %task.task_id,
                            "Build left PLANNED during submission, canceling task"
                        );
                        if let Err(e) = system.cancel_task(&task.task_id).await {
                            tracing::warn!(build_id, task_id = %task.task_id, "Task cancel failed: {e}");
                        }
                        return Ok(None);
                    };
                    return match self.take_held(submitted.artifact_type, &task.task_id) {
                        Some(early) => self.finish_held(submitted, &early).await,
                        None => Ok(Some(submitted)),
                    };
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                crate::metrics::submission("permanent", elapsed);
                let transition = BuildTransition::to(BuildState::Failed, error.to_string())
                    .completed_at(Utc::now());
                return self.events.transition_build(&build, transition).await;
            }

            crate::metrics::submission("transient", elapsed);
            if build.retry_count >= max_retries {
                let transition = BuildTransition::to(
                    BuildState::Failed,
                    format!("Giving up after {} retries: {error}", build.retry_count),
                )
                .completed_at(Utc::now());
                return self.events.transition_build(&build, transition).await;
            }

            let attempt = build.retry_count + 1;
            tracing::warn!(
                build_id,
                attempt,
                max_retries,
                "Transient submission failure, retrying: {error}"
            );
            let transition = BuildTransition::to(
                BuildState::Planned,
                format!("Retry {attempt} of {max_retries} after: {error}"),
            )
            .retry_count(attempt);
            if self.events.transition_build(&build, transition).await?.is_none() {
                return Ok(None);
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Keep a notification whose task id no build carries yet. Entries older
    /// than the hold window are dropped on the way.
    pub fn hold_notification(&self, notification: TaskNotification) {
        let window = self.config.notification_hold;
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|_, (_, at)| at.elapsed() < window);
        held.insert(
            (notification.artifact_type, notification.task_id.clone()),
            (notification, Instant::now()),
        );
    }

    /// Remove the held notification for a task. Whoever removes it applies it.
    pub fn take_held(&self, artifact_type: ArtifactType, task_id: &str) -> Option<TaskNotification> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let (notification, at) = held.remove(&(artifact_type, task_id.to_string()))?;
        (at.elapsed() < self.config.notification_hold).then_some(notification)
    }

    /// Apply a notification that arrived before its submission was recorded.
    /// Returns `None` if another writer moved the build first.
    async fn finish_held(
        &self,
        build: ArtifactBuild,
        notification: &TaskNotification,
    ) -> Result<Option<ArtifactBuild>, RebuildError> {
        tracing::info!(
            build_id = build.id,
            task_id = %notification.task_id,
            outcome = ?notification.outcome,
            "Applying notification held until the submission was recorded"
        );
        let transition = BuildTransition::to(notification.outcome.build_state(), notification.reason())
            .completed_at(Utc::now());
        let finished = self.events.transition_build(&build, transition).await?;
        if finished.is_some() {
            crate::metrics::notification("applied");
        }
        Ok(finished)
    }

    /// Mark every PLANNED descendant of a FAILED or CANCELED build with the
    /// same state. Nothing below it is ever submitted.
    pub async fn propagate(&self, build: &ArtifactBuild) -> Result<(), RebuildError> {
        let state = build.state;
        if !matches!(state, BuildState::Failed | BuildState::Canceled) {
            return Ok(());
        }
        let verb = if state == BuildState::Failed {
            "failed to build"
        } else {
            "was canceled"
        };

        let mut stack = vec![(build.id, build.original_nvr.clone())];
        while let Some((parent_id, parent_nvr)) = stack.pop() {
            for child in self.planned_children(parent_id).await? {
                let transition = BuildTransition::to(
                    state,
                    format!("Cannot build artifact, because its dependency {parent_nvr} {verb}."),
                )
                .completed_at(Utc::now());
                if let Some(updated) = self.events.transition_build(&child, transition).await? {
                    stack.push((updated.id, updated.original_nvr));
                }
            }
        }
        Ok(())
    }

    /// React to a build reaching a terminal state: release or fail its
    /// children, then fold the outcome into the event.
    pub async fn on_build_terminal(&self, build: &ArtifactBuild) -> Result<(), RebuildError> {
        match build.state {
            BuildState::Done => {
                let event = self.events.require(build.event_id).await?;
                let children = self.planned_children(build.id).await?;
                if event.state == EventState::Building && !children.is_empty() {
                    self.submit_wave(&event, children).await?;
                }
            }
            BuildState::Failed | BuildState::Canceled => self.propagate(build).await?,
            _ => return Ok(()),
        }
        self.settle(build.event_id).await
    }

    /// Recompute the event state; when it turns terminal, release events
    /// that were waiting on it.
    pub async fn settle(&self, event_id: i64) -> Result<(), RebuildError> {
        let mut queue = VecDeque::from([event_id]);
        while let Some(id) = queue.pop_front() {
            let event = self.events.recompute_state(id).await?;
            if !event.state.is_terminal() {
                continue;
            }
            for dependent in self.events.store().dependent_events(id).await? {
                if self.release(dependent).await? {
                    queue.push_back(dependent);
                }
            }
        }
        Ok(())
    }

    /// Start a waiting event once nothing blocks it. Returns whether wave 0
    /// was submitted.
    async fn release(&self, event_id: i64) -> Result<bool, RebuildError> {
        let event = self.events.require(event_id).await?;
        if event.state != EventState::Building {
            return Ok(false);
        }
        if !self.pending_dependencies(event_id).await?.is_empty() {
            return Ok(false);
        }
        let builds = self.events.builds(event_id).await?;
        if builds.iter().any(|b| b.state != BuildState::Planned) {
            return Ok(false);
        }

        let event = self
            .events
            .transition(
                event_id,
                EventState::Building,
                format!("Rebuilding {} artifact(s).", builds.len()),
            )
            .await?;
        tracing::info!(event_id, "Released waiting event");
        self.submit_wave(&event, planned_roots(&builds)).await?;
        Ok(true)
    }

    /// Cancel an event: the event turns CANCELED first, so no build outcome
    /// folded in meanwhile can complete or fail it. Then every non-terminal
    /// build becomes CANCELED and tasks in the build systems are asked to stop.
    pub async fn cancel_event(&self, event_id: i64, reason: &str) -> Result<Event, RebuildError> {
        let event = self.events.require(event_id).await?;
        if event.state.is_terminal() {
            return Ok(event);
        }
        let dry_run = self.is_dry_run(&event);

        let event = self
            .events
            .transition(event_id, EventState::Canceled, reason)
            .await?;
        if event.state != EventState::Canceled {
            return Ok(event);
        }

        for build in self.events.builds(event_id).await? {
            let mut current = build;
            while !current.state.is_terminal() {
                let was = current.state;
                let transition =
                    BuildTransition::to(BuildState::Canceled, reason).completed_at(Utc::now());
                match self.events.transition_build(&current, transition).await? {
                    Some(updated) => {
                        if was == BuildState::Build && !dry_run {
                            self.cancel_remote(&updated).await;
                        }
                        break;
                    }
                    None => match self.events.get_build(current.id).await? {
                        Some(fresh) => current = fresh,
                        None => break,
                    },
                }
            }
        }

        self.settle(event_id).await?;
        Ok(event)
    }

    async fn cancel_remote(&self, build: &ArtifactBuild) {
        let (Some(task_id), Some(system)) =
            (build.task_id.as_deref(), self.build_systems.get(build.artifact_type))
        else {
            return;
        };
        if let Err(e) = system.cancel_task(task_id).await {
            tracing::warn!(build_id = build.id, task_id, "Task cancel failed: {e}");
        }
    }

    /// Reload every BUILDING event and continue it: propagate failures that
    /// were not yet propagated, submit builds whose parent is DONE and settle.
    pub async fn resume(&self) -> Result<usize, RebuildError> {
        let building = self
            .events
            .find(&EventFilter::in_state(EventState::Building))
            .await?;
        let mut resumed = 0;
        for event in building {
            if !self.pending_dependencies(event.id).await?.is_empty() {
                continue;
            }

            for build in self.events.builds(event.id).await? {
                if matches!(build.state, BuildState::Failed | BuildState::Canceled) {
                    self.propagate(&build).await?;
                }
            }

            let builds = self.events.builds(event.id).await?;
            let ready: Vec<ArtifactBuild> = builds
                .iter()
                .filter(|b| b.state == BuildState::Planned)
                .filter(|b| match b.dep_on {
                    None => true,
                    Some(parent) => builds
                        .iter()
                        .find(|p| p.id == parent)
                        .map_or(true, |p| p.state == BuildState::Done),
                })
                .cloned()
                .collect();

            tracing::info!(event_id = event.id, ready = ready.len(), "Resuming event");
            self.submit_wave(&event, ready).await?;
            self.settle(event.id).await?;
            resumed += 1;
        }
        Ok(resumed)
    }
}

fn planned_roots(builds: &[ArtifactBuild]) -> Vec<ArtifactBuild> {
    builds
        .iter()
        .filter(|b| b.is_root() && b.state == BuildState::Planned)
        .cloned()
        .collect()
}

fn waiting_reason(blockers: &[i64]) -> String {
    let ids: Vec<String> = blockers.iter().map(|id| id.to_string()).collect();
    format!("Waiting for events {} to finish.", ids.join(", "))
}
