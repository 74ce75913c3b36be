//! Read model of an event and its rebuild forest.
//!
//! Builds are indexed by id and the children-by-parent index is derived
//! once per read from `dep_on`. Nothing here is authoritative; the store is.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::models::build::ArtifactBuild;
use crate::models::event::Event;

#[derive(Debug, Clone, Serialize)]
pub struct EventTree {
    pub event: Event,
    pub builds: BTreeMap<i64, ArtifactBuild>,
    pub children: BTreeMap<i64, Vec<i64>>,
    pub roots: Vec<i64>,
    pub waves: Vec<Vec<i64>>,
}

impl EventTree {
    pub fn new(event: Event, builds: Vec<ArtifactBuild>) -> Self {
        let builds: BTreeMap<i64, ArtifactBuild> = builds.into_iter().map(|b| (b.id, b)).collect();

        let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        let mut roots = Vec::new();
        for build in builds.values() {
            match build.dep_on {
                // A parent outside this event is treated as satisfied.
                Some(parent) if builds.contains_key(&parent) => {
                    children.entry(parent).or_default().push(build.id)
                }
                _ => roots.push(build.id),
            }
        }

        let waves = waves_from(&roots, &children);
        Self {
            event,
            builds,
            children,
            roots,
            waves,
        }
    }

    pub fn children_of(&self, build_id: i64) -> &[i64] {
        self.children
            .get(&build_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Depth of a build from its root (roots are depth 0).
    pub fn depth(&self, build_id: i64) -> Option<usize> {
        self.waves.iter().position(|wave| wave.contains(&build_id))
    }
}

/// Breadth-first levels of the forest. Level N holds every build whose
/// parent sits in level N-1.
pub fn waves_from(roots: &[i64], children: &BTreeMap<i64, Vec<i64>>) -> Vec<Vec<i64>> {
    let mut waves = Vec::new();
    let mut current: VecDeque<i64> = roots.iter().copied().collect();
    while !current.is_empty() {
        let wave: Vec<i64> = current.drain(..).collect();
        for id in &wave {
            if let Some(kids) = children.get(id) {
                current.extend(kids.iter().copied());
            }
        }
        waves.push(wave);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::models::artifact::ArtifactType;
    use crate::models::build::{BuildState, RebuildReason};
    use crate::models::event::EventState;
    use chrono::Utc;

    fn event() -> Event {
        Event {
            id: 1,
            message_id: "msg-1".into(),
            event_type: EventType::ManualRebuild,
            search_key: "manual".into(),
            state: EventState::Building,
            state_reason: String::new(),
            dry_run: false,
            requester: None,
            handler_results: Vec::new(),
            time_created: Utc::now(),
            time_done: None,
        }
    }

    fn build(id: i64, dep_on: Option<i64>) -> ArtifactBuild {
        ArtifactBuild {
            id,
            event_id: 1,
            name: format!("image-{id}"),
            artifact_type: ArtifactType::Image,
            original_nvr: format!("image-{id}-1-1"),
            rebuilt_nvr: None,
            state: BuildState::Planned,
            state_reason: String::new(),
            rebuild_reason: if dep_on.is_none() {
                RebuildReason::DirectlyAffected
            } else {
                RebuildReason::Dependency
            },
            dep_on,
            build_args: serde_json::Value::Null,
            task_id: None,
            retry_count: 0,
            time_created: Utc::now(),
            time_submitted: None,
            time_completed: None,
        }
    }

    #[test]
    fn waves_follow_parent_depth() {
        // 1 <- 2 <- 4, 3 standalone
        let tree = EventTree::new(
            event(),
            vec![build(1, None), build(2, Some(1)), build(3, None), build(4, Some(2))],
        );

        assert_eq!(tree.roots, vec![1, 3]);
        assert_eq!(tree.waves, vec![vec![1, 3], vec![2], vec![4]]);
        assert_eq!(tree.children_of(1), &[2]);
        assert!(tree.children_of(3).is_empty());
        assert_eq!(tree.depth(4), Some(2));
    }

    #[test]
    fn empty_event_has_no_waves() {
        let tree = EventTree::new(event(), Vec::new());
        assert!(tree.waves.is_empty());
        assert!(tree.roots.is_empty());
    }
}
