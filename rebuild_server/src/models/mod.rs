//! Rebuild data models: events, artifact builds and the derived tree view.

pub mod artifact;
pub mod build;
pub mod event;
pub mod tree;

pub use artifact::{ArtifactRef, ArtifactType};
pub use build::{ArtifactBuild, BuildState, BuildTransition, NewArtifactBuild, RebuildReason};
pub use event::{Event, EventFilter, EventState, HandlerOutcomeKind, HandlerResult, NewEvent};
pub use tree::EventTree;
