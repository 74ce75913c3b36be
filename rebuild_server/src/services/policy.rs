//! Allow/deny policy deciding which artifacts may be rebuilt.
//!
//! An artifact is allowed iff no deny rule matches and either the allow
//! list is empty or some allow rule matches. Every field set on a rule must
//! match; regexes must match the whole value.

use regex::Regex;
use serde::Deserialize;

use crate::models::artifact::{ArtifactRef, ArtifactType};
use crate::models::event::Event;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allow: Vec<RuleConfig>,
    #[serde(default)]
    pub deny: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub artifact_type: Option<ArtifactType>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub search_key: Option<String>,
}

#[derive(Debug, Clone)]
struct Rule {
    handler: Option<String>,
    artifact_type: Option<ArtifactType>,
    name: Option<Regex>,
    search_key: Option<Regex>,
}

fn full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            handler: config.handler.clone(),
            artifact_type: config.artifact_type,
            name: config.name.as_deref().map(full_match).transpose()?,
            search_key: config.search_key.as_deref().map(full_match).transpose()?,
        })
    }

    fn matches(&self, handler: &str, artifact: &ArtifactRef, search_key: &str) -> bool {
        self.handler.as_deref().map_or(true, |h| h == handler)
            && self.artifact_type.map_or(true, |t| t == artifact.artifact_type)
            && self.name.as_ref().map_or(true, |re| re.is_match(&artifact.name))
            && self.search_key.as_ref().map_or(true, |re| re.is_match(search_key))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Policy {
    allow: Vec<Rule>,
    deny: Vec<Rule>,
}

impl Policy {
    /// Allows everything.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn compile(config: &PolicyConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            allow: config.allow.iter().map(Rule::compile).collect::<Result<_, _>>()?,
            deny: config.deny.iter().map(Rule::compile).collect::<Result<_, _>>()?,
        })
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: PolicyConfig = serde_json::from_str(raw)?;
        Ok(Self::compile(&config)?)
    }

    pub fn is_allowed(&self, handler: &str, artifact: &ArtifactRef, event: &Event) -> bool {
        self.allows(handler, artifact, &event.search_key)
    }

    pub fn allows(&self, handler: &str, artifact: &ArtifactRef, search_key: &str) -> bool {
        if self
            .deny
            .iter()
            .any(|rule| rule.matches(handler, artifact, search_key))
        {
            return false;
        }
        self.allow.is_empty()
            || self
                .allow
                .iter()
                .any(|rule| rule.matches(handler, artifact, search_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> ArtifactRef {
        ArtifactRef::new(name, ArtifactType::Image, format!("{name}-1-1"))
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = Policy::permissive();
        assert!(policy.allows("manual_rebuild", &image("anything"), "key"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let policy = Policy::from_json(
            r#"{
                "allow": [{"artifact_type": "image", "name": "httpd.*"}],
                "deny": [{"name": "httpd-legacy"}]
            }"#,
        )
        .unwrap();

        assert!(policy.allows("h", &image("httpd-container"), "k"));
        assert!(!policy.allows("h", &image("httpd-legacy"), "k"));
        assert!(!policy.allows("h", &image("nginx"), "k"));
    }

    #[test]
    fn rules_scope_by_handler_and_search_key() {
        let policy = Policy::from_json(
            r#"{"allow": [{"handler": "rebuild_images_on_advisory", "search_key": "RHSA-.*"}]}"#,
        )
        .unwrap();

        assert!(policy.allows("rebuild_images_on_advisory", &image("a"), "RHSA-2024:1"));
        assert!(!policy.allows("rebuild_images_on_advisory", &image("a"), "RHBA-2024:1"));
        assert!(!policy.allows("manual_rebuild", &image("a"), "RHSA-2024:1"));
    }

    #[test]
    fn names_must_match_entirely() {
        let policy = Policy::from_json(r#"{"allow": [{"name": "httpd"}]}"#).unwrap();
        assert!(policy.allows("h", &image("httpd"), "k"));
        assert!(!policy.allows("h", &image("httpd-container"), "k"));
    }

    #[test]
    fn invalid_regex_is_rejected_at_load() {
        assert!(Policy::from_json(r#"{"deny": [{"name": "("}]}"#).is_err());
    }
}
