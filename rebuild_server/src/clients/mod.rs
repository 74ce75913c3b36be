//! Collaborator interfaces: external build systems and the metadata service.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MetadataError, SubmitError};
use crate::models::artifact::{ArtifactRef, ArtifactType};
use crate::models::build::ArtifactBuild;

pub use http::{HttpBuildSystem, HttpMetadata};

/// What a build system hands back for an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub task_id: String,
    /// NVR the build system will produce, when it knows it up front.
    #[serde(default)]
    pub rebuilt_nvr: Option<String>,
}

#[async_trait]
pub trait BuildSystem: Send + Sync {
    async fn submit_build(
        &self,
        build: &ArtifactBuild,
        args: &serde_json::Value,
    ) -> Result<SubmittedTask, SubmitError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), SubmitError>;
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Artifacts touched by the root cause identified by `search_key`
    /// (e.g. the images shipping RPMs of an advisory).
    async fn find_directly_affected(
        &self,
        search_key: &str,
    ) -> Result<Vec<ArtifactRef>, MetadataError>;

    /// Artifacts whose build inputs embed or derive from `artifact`.
    async fn find_affected_artifacts(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<Vec<ArtifactRef>, MetadataError>;
}

/// Used when no metadata service is configured.
pub struct NoMetadata;

#[async_trait]
impl MetadataService for NoMetadata {
    async fn find_directly_affected(
        &self,
        search_key: &str,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        Err(MetadataError::Unavailable(format!(
            "no metadata service configured to resolve {search_key}"
        )))
    }

    async fn find_affected_artifacts(
        &self,
        _artifact: &ArtifactRef,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        Ok(Vec::new())
    }
}

/// Build systems selected by artifact type.
#[derive(Clone, Default)]
pub struct BuildSystems {
    systems: HashMap<ArtifactType, Arc<dyn BuildSystem>>,
}

impl BuildSystems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, artifact_type: ArtifactType, system: Arc<dyn BuildSystem>) -> Self {
        self.systems.insert(artifact_type, system);
        self
    }

    pub fn get(&self, artifact_type: ArtifactType) -> Option<&Arc<dyn BuildSystem>> {
        self.systems.get(&artifact_type)
    }
}
