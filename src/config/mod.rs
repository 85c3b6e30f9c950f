// SPDX-License-Identifier: MIT

//! Configuration for engine hosting and the execution tiers.
//!
//! Configuration is typically loaded from a YAML file; every field has a
//! sensible default so embedders can also build an [`EngineConfig`] in code
//! and override only what they need.

pub mod consts;

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use consts::{
    DEFAULT_CONVERT_TIMEOUT_SECS, DEFAULT_FUEL_LEVEL, DEFAULT_INIT_BACKOFF_MS,
    DEFAULT_INIT_TIMEOUT_SECS, DEFAULT_MAX_CONVERSION_RETRIES, DEFAULT_MAX_INIT_RETRIES,
    MAX_ENGINE_MODULE_SIZE,
};

/// Complete configuration for one engine host.
///
/// # Example
/// ```yaml
/// module_path: ./engine/docengine.wasm
/// install_path: /engine
/// force_vtable: false
/// convert_timeout_secs: 300
/// resilience:
///   max_init_retries: 3
///   max_conversion_retries: 2
///   restart_on_memory_error: true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine `.wasm` module on the host filesystem.
    pub module_path: PathBuf,

    /// Install/resource path string handed to the engine's instance hook.
    /// Resolved inside the engine's own virtual filesystem, not the host's.
    #[serde(default = "default_install_path")]
    pub install_path: String,

    /// Force vtable traversal even when shim exports are present. Intended
    /// for engine builds whose shims are known-broken.
    #[serde(default)]
    pub force_vtable: bool,

    /// Fuel budget set on the store before every engine invocation.
    #[serde(default = "default_fuel_level")]
    pub fuel_level: u64,

    /// Maximum accepted engine module size in bytes.
    #[serde(default = "default_max_module_size")]
    pub max_module_size: usize,

    /// Per-request timeout for conversions. Minutes-scale: large documents
    /// legitimately take a long time.
    #[serde(default = "default_convert_timeout_secs")]
    pub convert_timeout_secs: u64,

    /// Timeout for a worker context to report ready after boot.
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// Side-process worker binary. When unset, `engine-worker` is resolved
    /// next to the current executable.
    #[serde(default)]
    pub worker_path: Option<PathBuf>,

    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Recovery policy knobs, consumed chiefly by the side-process tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Boot attempts before `WasmNotInitialized` becomes terminal.
    #[serde(default = "default_max_init_retries")]
    pub max_init_retries: u32,

    /// Same-conversion retries after a corruption-triggered respawn before
    /// `ConversionFailed` becomes terminal.
    #[serde(default = "default_max_conversion_retries")]
    pub max_conversion_retries: u32,

    /// Kill and respawn the side process when a corruption-class diagnostic
    /// is observed mid-conversion, then retry the same logical conversion.
    #[serde(default = "default_restart_on_memory_error")]
    pub restart_on_memory_error: bool,

    /// Base of the linear init backoff: attempt `n` sleeps `n * backoff`.
    #[serde(default = "default_init_backoff_ms")]
    pub init_backoff_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_init_retries: DEFAULT_MAX_INIT_RETRIES,
            max_conversion_retries: DEFAULT_MAX_CONVERSION_RETRIES,
            restart_on_memory_error: true,
            init_backoff_ms: DEFAULT_INIT_BACKOFF_MS,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from("engine.wasm"),
            install_path: default_install_path(),
            force_vtable: false,
            fuel_level: DEFAULT_FUEL_LEVEL,
            max_module_size: MAX_ENGINE_MODULE_SIZE,
            convert_timeout_secs: DEFAULT_CONVERT_TIMEOUT_SECS,
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
            worker_path: None,
            resilience: ResilienceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn init_backoff(&self) -> Duration {
        Duration::from_millis(self.resilience.init_backoff_ms)
    }
}

fn default_install_path() -> String {
    "/engine".to_string()
}

fn default_fuel_level() -> u64 {
    DEFAULT_FUEL_LEVEL
}

fn default_max_module_size() -> usize {
    MAX_ENGINE_MODULE_SIZE
}

fn default_convert_timeout_secs() -> u64 {
    DEFAULT_CONVERT_TIMEOUT_SECS
}

fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}

fn default_max_init_retries() -> u32 {
    DEFAULT_MAX_INIT_RETRIES
}

fn default_max_conversion_retries() -> u32 {
    DEFAULT_MAX_CONVERSION_RETRIES
}

fn default_restart_on_memory_error() -> bool {
    true
}

fn default_init_backoff_ms() -> u64 {
    DEFAULT_INIT_BACKOFF_MS
}

/// Load an [`EngineConfig`] from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> EngineResult<EngineConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    serde_yaml::from_str(&contents)
        .map_err(|e| EngineError::InvalidInput(format!("invalid engine config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::default();
        assert!(!config.force_vtable);
        assert_eq!(config.resilience.max_init_retries, 3);
        assert_eq!(config.resilience.max_conversion_retries, 2);
        assert!(config.resilience.restart_on_memory_error);
        assert!(config.convert_timeout() >= Duration::from_secs(60));
    }

    #[test]
    fn loads_minimal_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "module_path: /opt/engine/docengine.wasm").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.module_path,
            PathBuf::from("/opt/engine/docengine.wasm")
        );
        assert_eq!(config.install_path, "/engine");
    }

    #[test]
    fn loads_resilience_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "module_path: engine.wasm\nresilience:\n  max_conversion_retries: 5\n  restart_on_memory_error: false"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.resilience.max_conversion_retries, 5);
        assert!(!config.resilience.restart_on_memory_error);
        // untouched fields keep their defaults
        assert_eq!(config.resilience.max_init_retries, 3);
    }

    #[test]
    fn rejects_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "module_path: [not, a, path").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
