//! Environment variable handling for configuration loading
//!
//! Two concerns live here:
//! - picking the active environment name (which selects the overlay file)
//! - applying `__`-delimited overrides such as `PROVIDERS__openai__TOKENLIMITPERMINUTE=600`
//!   on top of the merged JSON document
//!
//! Override keys are matched case-insensitively against keys that already exist in the
//! document. Values are coerced: `true`/`false` become booleans, integer or decimal
//! literals become numbers, text starting with `{` or `[` is parsed as JSON, anything
//! else stays a string.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::sync::LazyLock;
use tracing::debug;

/// Variables consulted for the environment name, first defined wins
pub const ENVIRONMENT_VARIABLES: [&str; 3] =
    ["MODELGATE_ENVIRONMENT", "APP_ENVIRONMENT", "ENVIRONMENT"];

/// Environment name used when none of [`ENVIRONMENT_VARIABLES`] is set
pub const DEFAULT_ENVIRONMENT: &str = "Production";

/// Path separator inside override variable names
const PATH_SEPARATOR: &str = "__";

static NUMBER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").expect("valid number pattern"));

/// Where environment variables are read from
///
/// Tests inject a fixed map so they never depend on (or mutate) the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: Option<HashMap<String, String>>,
}

impl EnvSource {
    /// Read from the process environment
    pub fn system() -> Self {
        Self { vars: None }
    }

    /// Read from a fixed set of variables
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Get a single variable
    pub fn get(&self, name: &str) -> Option<String> {
        match &self.vars {
            Some(vars) => vars.get(name).cloned(),
            None => env::var(name).ok(),
        }
    }

    /// All variables, sorted by name so overrides apply in a stable order
    ///
    /// Process variables whose name or value is not valid UTF-8 are skipped.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = match &self.vars {
            Some(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => env::vars_os()
                .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        };
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Resolve the active environment name
    pub fn environment_name(&self) -> String {
        ENVIRONMENT_VARIABLES
            .iter()
            .filter_map(|name| self.get(name))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
    }
}

/// Apply every matching environment override to `root`
///
/// Returns the number of overrides applied.
pub fn apply_env_overrides(root: &mut Map<String, Value>, source: &EnvSource) -> usize {
    let mut applied = 0;

    for (name, raw) in source.vars() {
        let segments: Vec<&str> = name.split(PATH_SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            continue;
        }

        // Only variables addressing an existing top-level key take part
        if find_key(root, segments[0]).is_none() {
            continue;
        }

        set_path(root, &segments, coerce_value(&raw));
        debug!(variable = %name, "Applied configuration override from environment");
        applied += 1;
    }

    applied
}

/// Coerce a raw environment string into a JSON value
pub fn coerce_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    let trimmed = raw.trim();
    if NUMBER_PATTERN.is_match(trimmed) {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::from(n);
        }
        if let Some(n) = trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(n);
        }
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return parsed;
        }
    }

    Value::String(raw.to_string())
}

/// Case-insensitive lookup of an existing key, returning its real spelling
fn find_key(map: &Map<String, Value>, wanted: &str) -> Option<String> {
    if map.contains_key(wanted) {
        return Some(wanted.to_string());
    }
    map.keys().find(|k| k.eq_ignore_ascii_case(wanted)).cloned()
}

fn set_path(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let key = find_key(map, segments[0]).unwrap_or_else(|| segments[0].to_string());

    if segments.len() == 1 {
        map.insert(key, value);
        return;
    }

    let child = map
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child) = child {
        set_path(child, &segments[1..], value);
    }
}
