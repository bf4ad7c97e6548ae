//! Configuration for the model memory ledger
//!
//! A [`MemoryManagerConfig`] can be built in code, derived from the installed
//! system RAM, or loaded from a YAML/TOML/JSON file with `MOFA_MODEL_MEMORY_*`
//! environment variables layered on top.

use std::path::Path;

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::error::ConfigError;

/// Fraction of the memory limit at which the ledger reports memory pressure.
pub const DEFAULT_PRESSURE_THRESHOLD: f64 = 0.9;

/// Prefix for environment overrides, e.g. `MOFA_MODEL_MEMORY_PRESSURE_THRESHOLD=0.8`.
pub const ENV_PREFIX: &str = "MOFA_MODEL_MEMORY";

/// Result type for config operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for [`MemoryLedger`](crate::MemoryLedger)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    /// Upper bound on tracked model memory in bytes. `0` means unlimited:
    /// no eviction is ever required and pressure is never reported.
    pub memory_limit_bytes: u64,

    /// Fraction of `memory_limit_bytes` (in `(0, 1]`) at or above which the
    /// ledger reports memory pressure.
    pub pressure_threshold: f64,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 0,
            pressure_threshold: DEFAULT_PRESSURE_THRESHOLD,
        }
    }
}

impl MemoryManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the memory limit from installed RAM.
    ///
    /// `fraction` is the share of total system memory models may occupy,
    /// e.g. `0.5` on a phone that also has to keep the UI responsive.
    pub fn from_system_memory(fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "system_memory_fraction",
                reason: format!("must be in (0, 1], got {fraction}"),
            });
        }

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        let total = sys.total_memory();

        Ok(Self {
            memory_limit_bytes: (total as f64 * fraction) as u64,
            ..Self::default()
        })
    }

    /// Set the memory limit in bytes (`0` = unlimited)
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the pressure threshold fraction
    pub fn with_pressure_threshold(mut self, threshold: f64) -> Result<Self> {
        check_threshold(threshold)?;
        self.pressure_threshold = threshold;
        Ok(self)
    }

    /// Check values that may have bypassed the builders (deserialization,
    /// direct field access).
    pub fn validate(&self) -> Result<()> {
        check_threshold(self.pressure_threshold)
    }

    /// Load configuration from a file, detecting the format from its extension.
    ///
    /// Environment variables prefixed with [`ENV_PREFIX`] override file values,
    /// e.g. `MOFA_MODEL_MEMORY_PRESSURE_THRESHOLD=0.8`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;

        let config: Self = Cfg::builder()
            .add_source(File::from_str(&content, format))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string with an explicit format.
    pub fn parse(content: &str, format: FileFormat) -> Result<Self> {
        let config: Self = Cfg::builder()
            .add_source(File::from_str(content, format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }
}

fn check_threshold(threshold: f64) -> Result<()> {
    // Negated so NaN is rejected too.
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigError::Invalid {
            field: "pressure_threshold",
            reason: format!("must be in (0, 1], got {threshold}"),
        });
    }
    Ok(())
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> Result<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================
