//! Event handlers.
//!
//! A handler is a capability predicate plus a process function over the
//! event payload. Handlers are a closed set of variants kept in a fixed
//! declared order; the registry only decides which of them are enabled.

use std::collections::HashSet;
use std::sync::Arc;

use crate::clients::MetadataService;
use crate::config::RebuildConfig;
use crate::error::HandlerError;
use crate::events::notification::{TaskNotification, TaskOutcome};
use crate::events::{EventPayload, InboundMessage, ModuleBuildState};
use crate::models::artifact::{ArtifactRef, ArtifactType};
use crate::models::build::ArtifactBuild;
use crate::models::event::Event;
use crate::services::aggregator::{Aggregator, NotificationResult};
use crate::services::event_service::EventService;
use crate::services::planner::Planner;

/// Collaborators a handler may use.
#[derive(Clone)]
pub struct HandlerContext {
    pub events: EventService,
    pub planner: Planner,
    pub aggregator: Aggregator,
    pub metadata: Arc<dyn MetadataService>,
}

#[derive(Debug)]
pub enum HandlerOutcome {
    /// Builds were planned under the event.
    Planned {
        builds: Vec<ArtifactBuild>,
        detail: String,
    },
    /// Work was handed on: follow-up events to enqueue, or a state update
    /// passed to the aggregator.
    Forwarded {
        follow_ups: Vec<InboundMessage>,
        detail: String,
    },
    /// Nothing to do for this event.
    Declined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    TrackModuleBuildState,
    RebuildImagesOnAdvisory,
    RebuildOnModuleReady,
    RebuildOnContentChange,
    ManualRebuild,
}

impl HandlerKind {
    /// Declared dispatch order.
    pub const ALL: [HandlerKind; 5] = [
        HandlerKind::TrackModuleBuildState,
        HandlerKind::RebuildImagesOnAdvisory,
        HandlerKind::RebuildOnModuleReady,
        HandlerKind::RebuildOnContentChange,
        HandlerKind::ManualRebuild,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HandlerKind::TrackModuleBuildState => "track_module_build_state",
            HandlerKind::RebuildImagesOnAdvisory => "rebuild_images_on_advisory",
            HandlerKind::RebuildOnModuleReady => "rebuild_on_module_ready",
            HandlerKind::RebuildOnContentChange => "rebuild_on_content_change",
            HandlerKind::ManualRebuild => "manual_rebuild",
        }
    }

    pub fn can_handle(&self, payload: &EventPayload) -> bool {
        match (self, payload) {
            (HandlerKind::TrackModuleBuildState, EventPayload::ModuleStateChanged { state, .. }) => {
                matches!(state, ModuleBuildState::Ready | ModuleBuildState::Failed)
            }
            (
                HandlerKind::RebuildImagesOnAdvisory,
                EventPayload::AdvisorySigned { content_types, .. },
            ) => content_types.iter().any(|t| t == "rpm" || t == "module"),
            (HandlerKind::RebuildOnModuleReady, EventPayload::ModuleStateChanged { state, .. }) => {
                *state == ModuleBuildState::Ready
            }
            (HandlerKind::RebuildOnContentChange, EventPayload::ContentChanged { .. }) => true,
            (HandlerKind::ManualRebuild, EventPayload::ManualRebuild { .. }) => true,
            _ => false,
        }
    }

    pub async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &Event,
        payload: &EventPayload,
    ) -> Result<HandlerOutcome, HandlerError> {
        match (self, payload) {
            (
                HandlerKind::TrackModuleBuildState,
                EventPayload::ModuleStateChanged {
                    build_id, state, ..
                },
            ) => track_module_build(ctx, *build_id, *state).await,
            (HandlerKind::RebuildImagesOnAdvisory, EventPayload::AdvisorySigned { advisory_id, .. }) => {
                let affected = ctx.metadata.find_directly_affected(advisory_id).await?;
                if affected.is_empty() {
                    return Ok(HandlerOutcome::Declined(format!(
                        "Advisory {advisory_id} does not affect any artifact."
                    )));
                }
                plan(ctx, self.name(), event, affected).await
            }
            (
                HandlerKind::RebuildOnModuleReady,
                EventPayload::ModuleStateChanged {
                    name,
                    stream,
                    version,
                    build_id,
                    ..
                },
            ) => module_ready(ctx, event, name, stream, version, *build_id).await,
            (HandlerKind::RebuildOnContentChange, EventPayload::ContentChanged { artifacts, .. }) => {
                let mut affected = Vec::new();
                let mut seen = HashSet::new();
                for changed in artifacts {
                    for dependent in ctx.metadata.find_affected_artifacts(changed).await? {
                        if seen.insert(dependent.nvr.clone()) {
                            affected.push(dependent);
                        }
                    }
                }
                if affected.is_empty() {
                    return Ok(HandlerOutcome::Declined(format!(
                        "Nothing depends on {}.",
                        event.search_key
                    )));
                }
                plan(ctx, self.name(), event, affected).await
            }
            (
                HandlerKind::ManualRebuild,
                EventPayload::ManualRebuild {
                    search_key,
                    artifacts,
                },
            ) => {
                let affected = if !artifacts.is_empty() {
                    artifacts.clone()
                } else if let Some(key) = search_key {
                    ctx.metadata.find_directly_affected(key).await?
                } else {
                    return Ok(HandlerOutcome::Declined(
                        "Manual rebuild names neither artifacts nor a search key.".to_string(),
                    ));
                };
                if affected.is_empty() {
                    return Ok(HandlerOutcome::Declined(format!(
                        "Nothing to rebuild for {}.",
                        event.search_key
                    )));
                }
                plan(ctx, self.name(), event, affected).await
            }
            _ => Ok(HandlerOutcome::Declined(format!(
                "{} cannot handle {} events.",
                self.name(),
                payload.event_type()
            ))),
        }
    }
}

async fn plan(
    ctx: &HandlerContext,
    handler: &str,
    event: &Event,
    affected: Vec<ArtifactRef>,
) -> Result<HandlerOutcome, HandlerError> {
    let builds = ctx.planner.plan(handler, event, affected).await?;
    if builds.is_empty() {
        return Ok(HandlerOutcome::Declined(
            "No affected artifact is allowed to be rebuilt.".to_string(),
        ));
    }
    let detail = format!("Planned {} build(s).", builds.len());
    Ok(HandlerOutcome::Planned { builds, detail })
}

/// Forward the final state of a module build this service submitted.
async fn track_module_build(
    ctx: &HandlerContext,
    build_id: i64,
    state: ModuleBuildState,
) -> Result<HandlerOutcome, HandlerError> {
    let outcome = match state {
        ModuleBuildState::Ready => TaskOutcome::Succeeded,
        ModuleBuildState::Failed => TaskOutcome::Failed,
        _ => {
            return Ok(HandlerOutcome::Declined(format!(
                "Module build {build_id} is not finished."
            )))
        }
    };

    let notification = TaskNotification::new(ArtifactType::Module, build_id.to_string(), outcome)
        .with_reason(format!("Module build {build_id} ended {state:?}."));
    match ctx.aggregator.apply(&notification).await? {
        NotificationResult::Unknown | NotificationResult::Held => Ok(HandlerOutcome::Declined(
            format!("Module build {build_id} was not submitted by this service."),
        )),
        NotificationResult::Duplicate(build) | NotificationResult::Applied(build) => {
            Ok(HandlerOutcome::Forwarded {
                follow_ups: Vec::new(),
                detail: format!("Build {} is {}.", build.id, build.state),
            })
        }
    }
}

/// Enqueue a rebuild of everything depending on a module that became ready,
/// unless that module is itself a rebuild rooted at the same module.
async fn module_ready(
    ctx: &HandlerContext,
    event: &Event,
    name: &str,
    stream: &str,
    version: &str,
    build_id: i64,
) -> Result<HandlerOutcome, HandlerError> {
    let store = ctx.events.store();
    if let Some(build) = store
        .build_by_task_id(ArtifactType::Module, &build_id.to_string())
        .await?
    {
        let mut root = None;
        let mut parent = build.dep_on;
        while let Some(id) = parent {
            let Some(p) = store.get_build(id).await? else {
                break;
            };
            parent = p.dep_on;
            root = Some(p);
        }
        if root.is_some_and(|r| r.name == name) {
            return Ok(HandlerOutcome::Declined(format!(
                "Skipping rebuild triggered by {name}:{stream}, it would result in a build loop."
            )));
        }
    }

    let nvr = format!("{name}-{stream}-{version}");
    let follow_up = InboundMessage {
        msg_id: format!("{}.content_changed", event.message_id),
        dry_run: event.dry_run,
        requester: event.requester.clone(),
        event: EventPayload::ContentChanged {
            search_key: nvr.clone(),
            artifacts: vec![ArtifactRef::new(name, ArtifactType::Module, nvr.clone())],
        },
    };
    Ok(HandlerOutcome::Forwarded {
        follow_ups: vec![follow_up],
        detail: format!("Enqueued rebuild of artifacts depending on {nvr}."),
    })
}

/// Enabled handlers, in declared order.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerKind>,
}

impl HandlerRegistry {
    pub fn all() -> Self {
        Self {
            handlers: HandlerKind::ALL.to_vec(),
        }
    }

    pub fn from_config(config: &RebuildConfig) -> Self {
        let handlers: Vec<HandlerKind> = HandlerKind::ALL
            .into_iter()
            .filter(|h| config.handler_enabled(h.name()))
            .collect();
        tracing::info!(
            handlers = ?handlers.iter().map(HandlerKind::name).collect::<Vec<_>>(),
            "Handlers enabled"
        );
        Self { handlers }
    }

    pub fn handlers(&self) -> &[HandlerKind] {
        &self.handlers
    }

    pub fn matching(&self, payload: &EventPayload) -> Vec<HandlerKind> {
        self.handlers
            .iter()
            .copied()
            .filter(|h| h.can_handle(payload))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_event(state: ModuleBuildState) -> EventPayload {
        EventPayload::ModuleStateChanged {
            name: "nodejs".into(),
            stream: "18".into(),
            version: "1".into(),
            build_id: 9,
            state,
        }
    }

    #[test]
    fn ready_module_matches_tracking_before_rebuild() {
        let matched = HandlerRegistry::all().matching(&module_event(ModuleBuildState::Ready));
        assert_eq!(
            matched,
            vec![HandlerKind::TrackModuleBuildState, HandlerKind::RebuildOnModuleReady]
        );
    }

    #[test]
    fn unfinished_module_matches_nothing() {
        assert!(HandlerRegistry::all()
            .matching(&module_event(ModuleBuildState::Build))
            .is_empty());
    }

    #[test]
    fn advisory_without_rpm_content_is_not_handled() {
        let payload = EventPayload::AdvisorySigned {
            advisory_id: "RHBA-1".into(),
            advisory_name: None,
            content_types: vec!["docker".into()],
        };
        assert!(HandlerRegistry::all().matching(&payload).is_empty());
    }

    #[test]
    fn registry_honors_enablement() {
        let config = RebuildConfig {
            enabled_handlers: Some(vec!["manual_rebuild".into()]),
            ..RebuildConfig::default()
        };
        assert_eq!(
            HandlerRegistry::from_config(&config).handlers(),
            &[HandlerKind::ManualRebuild]
        );
    }

    #[test]
    fn shared_payloads_never_reach_a_planning_handler() {
        let planning = [
            HandlerKind::RebuildImagesOnAdvisory,
            HandlerKind::RebuildOnContentChange,
            HandlerKind::ManualRebuild,
        ];
        let payloads = [
            module_event(ModuleBuildState::Ready),
            module_event(ModuleBuildState::Failed),
            EventPayload::AdvisorySigned {
                advisory_id: "RHSA-1".into(),
                advisory_name: None,
                content_types: vec!["rpm".into(), "module".into()],
            },
            EventPayload::ContentChanged {
                search_key: "openssl-3-1".into(),
                artifacts: Vec::new(),
            },
            EventPayload::ManualRebuild {
                search_key: Some("openssl-3-1".into()),
                artifacts: Vec::new(),
            },
        ];
        for payload in &payloads {
            let matched = HandlerRegistry::all().matching(payload);
            if matched.len() > 1 {
                assert!(
                    matched.iter().all(|h| !planning.contains(h)),
                    "{matched:?} share a payload with a planning handler"
                );
            }
        }
    }
}
