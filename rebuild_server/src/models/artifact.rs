//! Artifact references exchanged with the metadata and build-system clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Rpm,
    Image,
    Module,
    ImageRepository,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 4] = [
        ArtifactType::Rpm,
        ArtifactType::Image,
        ArtifactType::Module,
        ArtifactType::ImageRepository,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Rpm => "rpm",
            ArtifactType::Image => "image",
            ArtifactType::Module => "module",
            ArtifactType::ImageRepository => "image_repository",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown artifact type: {s}"))
    }
}

/// A concrete artifact version, as named by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub nvr: String,
    #[serde(default)]
    pub build_args: serde_json::Value,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, artifact_type: ArtifactType, nvr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact_type,
            nvr: nvr.into(),
            build_args: serde_json::Value::Null,
        }
    }
}

/// NVR assigned to a rebuild when the build system does not report one:
/// the original NVR with a unix-timestamp release suffix.
pub fn rebuilt_nvr(original_nvr: &str, now: DateTime<Utc>) -> String {
    format!("{original_nvr}.{}", now.timestamp())
}
