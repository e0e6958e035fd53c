//! Configuration normalization and validation

use super::types::*;
use crate::error::{GatewayError, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Turn a merged JSON document into a validated snapshot
pub fn build_snapshot(environment_name: &str, root: Map<String, Value>) -> Result<GatewayConfig> {
    let raw: RawConfig = serde_json::from_value(Value::Object(root))?;

    let mut providers = BTreeMap::new();
    for (name, value) in raw.providers {
        let raw_provider: RawProvider = serde_json::from_value(value).map_err(|e| {
            GatewayError::ConfigParse(format!("Provider '{}' is malformed: {}", name, e))
        })?;

        match build_provider(&name, raw_provider) {
            Some(provider) => {
                providers.insert(name, provider);
            }
            None => debug!(provider = %name, "Skipping provider without routePrefix or upstreamTemplate"),
        }
    }

    let config = GatewayConfig {
        environment_name: environment_name.to_string(),
        host: raw.host.trim().to_string(),
        port: raw.port,
        convert_token: raw.convert_token,
        token_endpoint: raw
            .token_endpoint
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        debug_path: raw
            .debug_path
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        providers,
    };

    validate_config(&config)?;
    Ok(config)
}

/// Validate the entire configuration
pub fn validate_config(config: &GatewayConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(GatewayError::ConfigValidation(
            "host must not be empty".to_string(),
        ));
    }

    if config.convert_token && config.token_endpoint.is_empty() {
        return Err(GatewayError::ConfigValidation(
            "convertToken is enabled but tokenEndpoint is empty".to_string(),
        ));
    }

    if config.convert_token {
        url::Url::parse(&config.token_endpoint).map_err(|e| {
            GatewayError::ConfigValidation(format!(
                "Invalid tokenEndpoint '{}': {}",
                config.token_endpoint, e
            ))
        })?;
    }

    warn_on_shared_prefixes(&config.providers);
    Ok(())
}

/// Normalize a route prefix: leading `/`, no trailing `/` unless it is the root
pub fn normalize_route_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return if prefix.trim().is_empty() {
            String::new()
        } else {
            "/".to_string()
        };
    }

    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Build a normalized provider, or `None` when it is inactive
pub(crate) fn build_provider(name: &str, raw: RawProvider) -> Option<ProviderConfig> {
    let route_prefix = normalize_route_prefix(raw.route_prefix.as_deref().unwrap_or_default());
    let upstream_template = raw
        .upstream_template
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if route_prefix.is_empty() || upstream_template.is_empty() {
        return None;
    }

    let token_limit_per_minute = if raw.token_limit_per_minute < 0 {
        warn!(
            provider = %name,
            limit = raw.token_limit_per_minute,
            "Negative tokenLimitPerMinute treated as unlimited"
        );
        0
    } else {
        raw.token_limit_per_minute as u64
    };

    let mut strip_request_properties: Vec<String> = Vec::new();
    for property in raw.strip_request_properties {
        let property = property.trim();
        if !property.is_empty() && !strip_request_properties.iter().any(|p| p == property) {
            strip_request_properties.push(property.to_string());
        }
    }

    let (model_ids, model_alias_lookup) = build_model_tables(name, &raw.models);

    Some(ProviderConfig {
        route_prefix,
        upstream_template,
        default_model: raw
            .default_model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty()),
        model_ids,
        model_alias_lookup,
        disable_streaming: raw.disable_streaming,
        strip_request_properties,
        token_limit_per_minute,
    })
}

/// Collect listed model ids and the alias lookup from the declared models
fn build_model_tables(
    provider: &str,
    models: &Map<String, Value>,
) -> (Vec<String>, HashMap<String, String>) {
    let mut ids: Vec<String> = Vec::new();
    let mut lookup: HashMap<String, String> = HashMap::new();

    fn push_id(ids: &mut Vec<String>, id: &str) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }

    for (model_name, entry) in models {
        let model_name = model_name.trim();
        if model_name.is_empty() {
            continue;
        }
        push_id(&mut ids, model_name);

        let aliases = match serde_json::from_value::<RawModel>(entry.clone()) {
            Ok(RawModel {
                model_alias: Some(spec),
            }) => spec.into_vec(),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(provider = %provider, model = %model_name, "Ignoring malformed model entry: {}", e);
                Vec::new()
            }
        };

        for alias in aliases {
            let alias = alias.trim();
            if alias.is_empty() || alias.eq_ignore_ascii_case(model_name) {
                continue;
            }
            lookup
                .entry(alias.to_lowercase())
                .or_insert_with(|| model_name.to_string());
            push_id(&mut ids, alias);
        }
    }

    (ids, lookup)
}

fn warn_on_shared_prefixes(providers: &BTreeMap<String, ProviderConfig>) {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for (name, provider) in providers {
        let key = provider.route_prefix.to_lowercase();
        if let Some(first) = seen.get(&key) {
            warn!(
                prefix = %provider.route_prefix,
                winner = %first,
                shadowed = %name,
                "Providers share a route prefix; the lexicographically first name wins"
            );
        } else {
            seen.insert(key, name);
        }
    }
}
