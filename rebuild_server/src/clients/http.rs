//! JSON-over-HTTP clients for build systems and the metadata service.
//!
//! Network failures, 5xx and 429 are transient. Other 4xx responses are
//! permanent rejections.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use super::{BuildSystem, MetadataService, SubmittedTask};
use crate::error::{MetadataError, SubmitError};
use crate::models::artifact::ArtifactRef;
use crate::models::build::ArtifactBuild;

const USER_AGENT: &str = "centrix-rebuild";

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub struct HttpBuildSystem {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBuildSystem {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BuildSystem for HttpBuildSystem {
    async fn submit_build(
        &self,
        build: &ArtifactBuild,
        args: &serde_json::Value,
    ) -> Result<SubmittedTask, SubmitError> {
        let url = format!("{}/builds", self.base_url);
        let body = json!({
            "name": build.name,
            "artifact_type": build.artifact_type,
            "original_nvr": build.original_nvr,
            "args": args,
        });

        let resp = self
            .client
            .post(&url)
            .header("User-Agent", USER_AGENT)
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{url}: {status} {text}");
            return Err(if is_retryable(status) {
                SubmitError::Transient(msg)
            } else {
                SubmitError::Permanent(msg)
            });
        }

        resp.json::<SubmittedTask>()
            .await
            .map_err(|e| SubmitError::Permanent(format!("{url}: unreadable response: {e}")))
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), SubmitError> {
        let url = format!("{}/tasks/{task_id}/cancel", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let msg = format!("{url}: {status}");
        Err(if is_retryable(status) {
            SubmitError::Transient(msg)
        } else {
            SubmitError::Permanent(msg)
        })
    }
}

pub struct HttpMetadata {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadata {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn read(&self, req: reqwest::RequestBuilder) -> Result<Vec<ArtifactRef>, MetadataError> {
        let resp = req
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| MetadataError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{status} {text}");
            return Err(if is_retryable(status) {
                MetadataError::Transient(msg)
            } else {
                MetadataError::Unavailable(msg)
            });
        }

        resp.json::<Vec<ArtifactRef>>()
            .await
            .map_err(|e| MetadataError::Unavailable(format!("unreadable metadata: {e}")))
    }
}

#[async_trait]
impl MetadataService for HttpMetadata {
    async fn find_directly_affected(
        &self,
        search_key: &str,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        let url = format!("{}/affected", self.base_url);
        self.read(self.client.get(&url).query(&[("search_key", search_key)]))
            .await
    }

    async fn find_affected_artifacts(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<Vec<ArtifactRef>, MetadataError> {
        let url = format!("{}/dependents", self.base_url);
        self.read(self.client.post(&url).json(artifact)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
