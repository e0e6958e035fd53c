//! Configuration type definitions
//!
//! The `Raw*` types mirror the JSON file layout and are only used while loading.
//! [`GatewayConfig`] is the immutable snapshot handed to the rest of the gateway.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Immutable configuration snapshot
///
/// Replaced wholesale on reload, never mutated in place.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Active environment name (selects the overlay file)
    pub environment_name: String,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Exchange inbound credentials for upstream bearer tokens
    pub convert_token: bool,

    /// Token exchange endpoint
    pub token_endpoint: String,

    /// Directory for request/response debug records
    pub debug_path: Option<String>,

    /// Active providers by name
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment_name: super::env::DEFAULT_ENVIRONMENT.to_string(),
            host: default_host(),
            port: default_port(),
            convert_token: false,
            token_endpoint: String::new(),
            debug_path: None,
            providers: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Bind address as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Look up a provider by its exact (case-sensitive) name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

/// Normalized provider configuration
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Path prefix, always with a leading `/` and no trailing `/` (unless root)
    pub route_prefix: String,

    /// Upstream URL containing a `{model}` placeholder
    pub upstream_template: String,

    /// Model used when the request does not name one
    pub default_model: Option<String>,

    /// Declared model names followed by their aliases, deduplicated, first-seen order
    pub model_ids: Vec<String>,

    /// Lowercase alias to canonical model name
    pub model_alias_lookup: HashMap<String, String>,

    /// Force `stream=false` on chat completion requests
    pub disable_streaming: bool,

    /// Top-level request properties removed before forwarding
    pub strip_request_properties: Vec<String>,

    /// Token budget per minute, 0 = unlimited
    pub token_limit_per_minute: u64,
}

impl ProviderConfig {
    /// Whether requests to this provider go through the rate limiter
    pub fn is_rate_limited(&self) -> bool {
        self.token_limit_per_minute > 0
    }

    /// Canonical model for an alias (case-insensitive), if one is declared
    pub fn canonical_model(&self, name: &str) -> Option<&str> {
        self.model_alias_lookup
            .get(&name.to_lowercase())
            .map(String::as_str)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Root of the configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub convert_token: bool,

    #[serde(default)]
    pub token_endpoint: Option<String>,

    #[serde(default)]
    pub debug_path: Option<String>,

    #[serde(default)]
    pub providers: Map<String, Value>,
}

/// A provider entry as written in the file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RawProvider {
    pub route_prefix: Option<String>,
    pub upstream_template: Option<String>,
    pub default_model: Option<String>,
    /// Kept as a JSON map so declaration order survives
    pub models: Map<String, Value>,
    pub disable_streaming: bool,
    pub strip_request_properties: Vec<String>,
    pub token_limit_per_minute: i64,
}

/// A model entry as written in the file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RawModel {
    pub model_alias: Option<AliasSpec>,
}

/// `modelAlias` accepts a single alias or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum AliasSpec {
    One(String),
    Many(Vec<String>),
}

impl AliasSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            AliasSpec::One(alias) => vec![alias],
            AliasSpec::Many(aliases) => aliases,
        }
    }
}
