//! Configuration module for the gateway
//!
//! Configuration is a required `config.json` in the root directory, deep-merged with an
//! optional `config.{Environment}.json` overlay, then patched by `__`-delimited
//! environment variables. The result is validated into an immutable [`GatewayConfig`]
//! snapshot held by [`ConfigStore`], which swaps it atomically on hot reload.

mod env;
mod reload;
mod types;
mod validation;

pub use env::{
    apply_env_overrides, coerce_value, EnvSource, DEFAULT_ENVIRONMENT, ENVIRONMENT_VARIABLES,
};
pub use reload::*;
pub use types::*;
pub use validation::{build_snapshot, normalize_route_prefix, validate_config};

use crate::error::{GatewayError, Result};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Name of the required base configuration file
pub const BASE_CONFIG_FILE: &str = "config.json";

/// Name of the overlay file for an environment
pub fn overlay_file_name(environment: &str) -> String {
    format!("config.{}.json", environment)
}

/// Load configuration from a root directory using the process environment
pub fn load_config<P: AsRef<Path>>(root_dir: P) -> Result<GatewayConfig> {
    load_config_with_env(root_dir, &EnvSource::system())
}

/// Load configuration with an explicit environment source
pub fn load_config_with_env<P: AsRef<Path>>(root_dir: P, env: &EnvSource) -> Result<GatewayConfig> {
    let root_dir = root_dir.as_ref();
    let environment = env.environment_name();

    let mut merged = read_json_object(&root_dir.join(BASE_CONFIG_FILE), true)?;
    let overlay = read_json_object(&root_dir.join(overlay_file_name(&environment)), false)?;
    deep_merge(&mut merged, overlay);
    apply_env_overrides(&mut merged, env);

    build_snapshot(&environment, merged)
}

/// Read a JSON file that must contain an object
///
/// A missing optional file yields an empty object.
fn read_json_object(path: &Path, required: bool) -> Result<Map<String, Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => {
            return Err(GatewayError::ConfigLoad(format!(
                "Failed to read config file {:?}: {}",
                path, e
            )))
        }
    };

    let value: Value = serde_json::from_str(&content).map_err(|e| {
        GatewayError::ConfigParse(format!("Invalid JSON in {:?}: {}", path, e))
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(GatewayError::ConfigValidation(format!(
            "Root of {:?} must be a JSON object, found {}",
            path,
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively merge `overlay` into `base`
///
/// Objects merge key by key; every other value (arrays included) replaces wholesale.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Read-only handle to the current snapshot
///
/// Cloned into every component that needs configuration. Each call to
/// [`SnapshotReader::load`] returns whatever snapshot is current at that moment.
#[derive(Clone)]
pub struct SnapshotReader {
    current: Arc<ArcSwap<GatewayConfig>>,
}

impl SnapshotReader {
    /// A reader over a fixed snapshot that never reloads
    pub fn fixed(config: GatewayConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }
}

/// Callback run after each successful reload
pub type ReloadHook = Box<dyn Fn(&GatewayConfig) + Send + Sync>;

/// Owner of the configuration snapshot
pub struct ConfigStore {
    root_dir: PathBuf,
    env: EnvSource,
    environment: String,
    current: Arc<ArcSwap<GatewayConfig>>,
    hooks: RwLock<Vec<ReloadHook>>,
}

impl ConfigStore {
    /// Load the initial snapshot from `root_dir` using the process environment
    pub fn open<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        Self::open_with_env(root_dir, EnvSource::system())
    }

    /// Load the initial snapshot with an explicit environment source
    pub fn open_with_env<P: AsRef<Path>>(root_dir: P, env: EnvSource) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        let config = load_config_with_env(&root_dir, &env)?;
        info!(
            environment = %config.environment_name,
            providers = config.providers.len(),
            "Configuration loaded from {:?}",
            root_dir
        );

        Ok(Self {
            environment: config.environment_name.clone(),
            root_dir,
            env,
            current: Arc::new(ArcSwap::from_pointee(config)),
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Root directory being watched
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Base and overlay file names that trigger a reload
    pub fn watched_file_names(&self) -> [String; 2] {
        [
            BASE_CONFIG_FILE.to_string(),
            overlay_file_name(&self.environment),
        ]
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Read-only handle for other components
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            current: self.current.clone(),
        }
    }

    /// Register a callback run after every successful reload
    pub fn on_reload(&self, hook: ReloadHook) {
        self.hooks.write().push(hook);
    }

    /// Reload from disk
    ///
    /// On failure the previous snapshot stays in place and the error is returned to
    /// the caller (the watcher logs it).
    pub fn reload(&self) -> Result<Arc<GatewayConfig>> {
        let config = Arc::new(load_config_with_env(&self.root_dir, &self.env)?);
        self.current.store(config.clone());

        for hook in self.hooks.read().iter() {
            hook(&config);
        }

        info!(
            providers = config.providers.len(),
            "Configuration reloaded successfully"
        );
        Ok(config)
    }

    /// Reload, logging instead of returning failures
    pub fn reload_or_keep(&self) -> bool {
        match self.reload() {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to reload configuration: {}", e);
                warn!("Keeping current configuration");
                false
            }
        }
    }
}
