//! Rebuild engine configuration: loaded from environment variables.
//!
//! Loaded once at startup and shared read-only (`Arc<RebuildConfig>`) by the
//! dispatcher, planner and scheduler.

use std::time::Duration;

use crate::models::artifact::ArtifactType;
use crate::services::policy::Policy;

#[derive(Clone, Debug)]
pub struct RebuildConfig {
    /// HMAC secret for inbound bus messages.
    pub bus_secret: String,
    /// Transient submission retries per build.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Maximum number of submissions in flight across all events.
    pub max_concurrent: usize,
    /// A build stuck in BUILD longer than this is treated as failed.
    pub build_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a notification for a not yet recorded task id is held
    /// before it is dropped. Zero drops it at once.
    pub notification_hold: Duration,
    /// Redrives of a message whose handlers failed transiently.
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
    /// Force dry-run for every event.
    pub dry_run: bool,
    /// Enabled handler names; `None` enables all.
    pub enabled_handlers: Option<Vec<String>>,
    pub policy: Policy,
    pub metadata_url: Option<String>,
    pub build_system_urls: Vec<(ArtifactType, String)>,
    pub notify_url: Option<String>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            bus_secret: String::new(),
            max_retries: 3,
            retry_delay: Duration::from_millis(2000),
            max_concurrent: 8,
            build_timeout: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(60),
            notification_hold: Duration::from_secs(600),
            max_redeliveries: 5,
            redelivery_delay: Duration::from_secs(30),
            dry_run: false,
            enabled_handlers: None,
            policy: Policy::permissive(),
            metadata_url: None,
            build_system_urls: Vec::new(),
            notify_url: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl RebuildConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let bus_secret = std::env::var("REBUILD_BUS_SECRET").unwrap_or_default();
        let max_retries = env_parse("REBUILD_MAX_RETRIES").unwrap_or(defaults.max_retries);
        let retry_delay = env_parse("REBUILD_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay);
        let max_concurrent = env_parse::<usize>("REBUILD_MAX_CONCURRENT")
            .unwrap_or(defaults.max_concurrent)
            .max(1);
        let build_timeout = env_parse("REBUILD_BUILD_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.build_timeout);
        let sweep_interval = env_parse("REBUILD_SWEEP_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let notification_hold = env_parse("REBUILD_NOTIFICATION_HOLD_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.notification_hold);
        let max_redeliveries =
            env_parse("REBUILD_MAX_REDELIVERIES").unwrap_or(defaults.max_redeliveries);
        let redelivery_delay = env_parse("REBUILD_REDELIVERY_DELAY_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.redelivery_delay);
        let dry_run = env_parse("REBUILD_DRY_RUN").unwrap_or(false);
        let enabled_handlers = env_nonempty("REBUILD_HANDLERS")
            .filter(|s| s.trim() != "all")
            .map(|s| parse_list(&s));

        let policy = match env_nonempty("REBUILD_POLICY_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("reading policy file {path}: {e}"))?;
                Policy::from_json(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid policy file {path}: {e}"))?
            }
            None => Policy::permissive(),
        };

        let metadata_url = env_nonempty("REBUILD_METADATA_URL");
        let build_system_urls = match env_nonempty("REBUILD_BUILD_SYSTEM_URLS") {
            Some(raw) => parse_build_system_urls(&raw)?,
            None => Vec::new(),
        };
        let notify_url = env_nonempty("REBUILD_NOTIFY_URL");

        if bus_secret.is_empty() {
            tracing::warn!("REBUILD_BUS_SECRET not set -- bus message signature validation disabled");
        }
        if metadata_url.is_none() {
            tracing::warn!("REBUILD_METADATA_URL not set -- only explicit manual rebuilds can be planned");
        }
        if build_system_urls.is_empty() && !dry_run {
            tracing::warn!("REBUILD_BUILD_SYSTEM_URLS not set -- non dry-run builds will fail");
        }

        Ok(Self {
            bus_secret,
            max_retries,
            retry_delay,
            max_concurrent,
            build_timeout,
            sweep_interval,
            notification_hold,
            max_redeliveries,
            redelivery_delay,
            dry_run,
            enabled_handlers,
            policy,
            metadata_url,
            build_system_urls,
            notify_url,
        })
    }

    pub fn handler_enabled(&self, name: &str) -> bool {
        self.enabled_handlers
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == name))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `image=https://osbs,module=https://mbs`.
pub fn parse_build_system_urls(raw: &str) -> anyhow::Result<Vec<(ArtifactType, String)>> {
    parse_list(raw)
        .into_iter()
        .map(|pair| {
            let (kind, url) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected type=url, got {pair}"))?;
            let kind: ArtifactType = kind.trim().parse().map_err(|e: String| anyhow::anyhow!(e))?;
            Ok((kind, url.trim().to_string()))
        })
        .collect()
}
