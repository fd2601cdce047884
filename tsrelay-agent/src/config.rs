use std::{collections::BTreeMap, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use sysinfo::System;
use thiserror::Error;
use tsrelay::{BuildError, DedupWindow, PipelineBuilder, TagSet};

/// Errors that could occur while loading the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse configuration file '{path}': {source}")]
    Parse { path: String, source: toml::de::Error },

    #[error("collection frequency must be at least one second")]
    ZeroFrequency,
}

/// Agent configuration, read from a TOML file.
///
/// Every field is optional.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// TSDB host (`host:port`) or full URL of the put endpoint.
    pub host: Option<String>,

    /// Tags added to every collected point. `host` defaults to the short machine host name.
    pub tags: BTreeMap<String, String>,

    /// Seconds between two rounds of the same collector.
    pub freq_secs: u64,

    pub max_queue_len: usize,
    pub batch_size: usize,

    /// Duplicate suppression window in seconds. `0` disables suppression.
    pub ignore_duplicate_secs: u64,
    pub dedup_window: DedupWindow,
    pub cache_sweep: bool,
    pub request_timeout_secs: u64,
    pub retry_cutoff_secs: u64,
    pub failure_backoff_secs: u64,
    pub verbose: bool,

    /// HTTP checks, as `url[,route[,search[,Header:v1;v2...]]]`.
    pub http_checks: Vec<String>,

    /// Watched processes, as `command,name,argmatch`.
    pub processes: Vec<String>,

    /// Address of the diagnostics endpoint. Disabled when unset.
    pub diagnostics_addr: Option<SocketAddr>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            host: None,
            tags: BTreeMap::new(),
            freq_secs: 15,
            max_queue_len: 200_000,
            batch_size: 50,
            ignore_duplicate_secs: 0,
            dedup_window: DedupWindow::default(),
            cache_sweep: true,
            request_timeout_secs: 60,
            retry_cutoff_secs: 30 * 60,
            failure_backoff_secs: 5,
            verbose: false,
            http_checks: Vec::new(),
            processes: Vec::new(),
            diagnostics_addr: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        let config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path: display, source })?;
        if config.freq_secs == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        Ok(config)
    }

    /// The put endpoint URL, if a host is configured.
    ///
    /// A bare `host:port` is expanded to `http://host:port/api/put`.
    pub fn endpoint_url(&self) -> Option<String> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        if host.contains("://") {
            return Some(host.to_string());
        }
        Some(format!("http://{host}/api/put"))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.freq_secs)
    }

    /// The configured tags, with `host` filled in from the machine host name when missing.
    pub fn default_tags(&self) -> TagSet {
        let mut tags: TagSet = self.tags.iter().collect();
        if !tags.contains_key("host") {
            if let Some(host) = System::host_name().as_deref().and_then(short_host_name) {
                tags.insert("host", host);
            }
        }
        tags
    }

    pub fn pipeline_builder(&self, endpoint: &str) -> Result<PipelineBuilder, BuildError> {
        Ok(PipelineBuilder::new()
            .with_endpoint(endpoint)?
            .with_max_queue_len(self.max_queue_len)
            .with_batch_size(self.batch_size)
            .with_ignore_duplicate(Duration::from_secs(self.ignore_duplicate_secs))
            .with_dedup_window(self.dedup_window)
            .with_cache_sweep(self.cache_sweep)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_retry_cutoff(Duration::from_secs(self.retry_cutoff_secs))
            .with_failure_backoff(Duration::from_secs(self.failure_backoff_secs))
            .with_verbose(self.verbose))
    }
}

fn short_host_name(name: &str) -> Option<String> {
    let short = name.split('.').next().unwrap_or_default().trim().to_ascii_lowercase();
    (!short.is_empty()).then_some(short)
}
