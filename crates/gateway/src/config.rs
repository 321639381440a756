use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_refresh_ttl_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Json,
    Sse,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Json
    }
}

/// One upstream MCP server, as declared in the gateway's configuration file.
/// Immutable for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    pub prefix: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub health_enabled: bool,
    #[serde(default)]
    pub alt_url: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

impl UpstreamConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `MCP_<NAME>_URL` overrides `url` at startup, matching the convention
    /// the original gateway used for per-backend env overrides.
    fn env_override_key(&self) -> String {
        format!("MCP_{}_URL", self.name.to_uppercase())
    }

    fn apply_env_override(&mut self) {
        if let Ok(url) = std::env::var(self.env_override_key()) {
            if !url.is_empty() {
                self.url = url;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: u64,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl GatewayConfig {
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        for upstream in &mut config.upstreams {
            upstream.apply_env_override();
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if !names.insert(upstream.name.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate upstream name: {}",
                    upstream.name
                )));
            }
        }

        let mut prefixes = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if !upstream.enabled {
                continue;
            }
            if !prefixes.insert(upstream.prefix.clone()) {
                return Err(GatewayError::Config(format!(
                    "duplicate upstream prefix: {}",
                    upstream.prefix
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn enabled_upstreams(&self) -> Vec<&UpstreamConfig> {
        let mut v: Vec<&UpstreamConfig> = self.upstreams.iter().filter(|u| u.enabled).collect();
        v.sort_by_key(|u| u.priority);
        v
    }
}
