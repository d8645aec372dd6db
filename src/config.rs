//! Configuration management for the triplet kernel

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{KernelError, KernelResult};

/// Layer parameters of the triplet loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripletLossConfig {
    /// Required gap between anchor-negative and anchor-positive squared distances.
    pub margin: f32,
}

impl Default for TripletLossConfig {
    fn default() -> Self {
        Self { margin: 1.0 }
    }
}

impl TripletLossConfig {
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }

    pub fn validate(&self) -> KernelResult<()> {
        if !self.margin.is_finite() {
            return Err(KernelError::ConfigurationError(format!(
                "margin must be finite, got {}",
                self.margin
            )));
        }
        if self.margin < 0.0 {
            return Err(KernelError::ConfigurationError(format!(
                "margin must be non-negative, got {}",
                self.margin
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Spread per-sample work across the rayon pool.
    pub parallel: bool,
    /// Batches with fewer rows than this stay on the calling thread.
    pub min_parallel_rows: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_rows: 256,
        }
    }
}

impl PerformanceConfig {
    /// Whether a batch of `rows` samples should be processed in parallel.
    pub fn use_parallel(&self, rows: usize) -> bool {
        cfg!(feature = "parallel") && self.parallel && rows >= self.min_parallel_rows.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentConfig {
    pub log_level: String,
    pub verbose_logging: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            verbose_logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub triplet: TripletLossConfig,
    pub performance: PerformanceConfig,
    pub development: DevelopmentConfig,
}

impl KernelConfig {
    pub fn validate(&self) -> KernelResult<()> {
        self.triplet.validate()?;
        if self.development.log_level.trim().is_empty() {
            return Err(KernelError::ConfigurationError("log_level must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
pub struct ConfigManager {
    config: KernelConfig,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            config_file: None,
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> KernelResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: KernelConfig = serde_json::from_str(&content)?;
        config.validate()?;

        self.config = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!(path = %path.display(), margin = self.config.triplet.margin, "loaded kernel config");
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(path, content)?;

        tracing::info!(path = %path.display(), "saved kernel config");
        Ok(())
    }

    pub fn get_config(&self) -> KernelConfig {
        self.config.clone()
    }

    /// Apply `f` to a copy of the configuration; the change is kept only if
    /// the result validates.
    pub fn update_config<F>(&mut self, f: F) -> KernelResult<()>
    where
        F: FnOnce(&mut KernelConfig),
    {
        let mut candidate = self.config.clone();
        f(&mut candidate);
        candidate.validate()?;
        self.config = candidate;

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }

        Ok(())
    }

    pub fn set_config(&mut self, config: KernelConfig) -> KernelResult<()> {
        self.update_config(|c| *c = config)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Snapshot of the process-wide configuration
pub fn get_config() -> KernelConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Mutate the process-wide configuration; invalid results are discarded
pub fn update_config<F>(f: F) -> KernelResult<()>
where
    F: FnOnce(&mut KernelConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> KernelResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Fluent construction of a validated [`KernelConfig`]
pub struct ConfigBuilder {
    config: KernelConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
        }
    }

    pub fn triplet(mut self, f: impl FnOnce(&mut TripletLossConfig)) -> Self {
        f(&mut self.config.triplet);
        self
    }

    pub fn performance(mut self, f: impl FnOnce(&mut PerformanceConfig)) -> Self {
        f(&mut self.config.performance);
        self
    }

    pub fn development(mut self, f: impl FnOnce(&mut DevelopmentConfig)) -> Self {
        f(&mut self.config.development);
        self
    }

    pub fn build(self) -> KernelResult<KernelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn apply(self) -> KernelResult<()> {
        let config = self.build()?;
        update_config(|c| *c = config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .triplet(|t| t.margin = 0.2)
            .performance(|p| {
                p.parallel = false;
                p.min_parallel_rows = 64;
            })
            .build()
            .unwrap();

        assert_eq!(config.triplet.margin, 0.2);
        assert!(!config.performance.parallel);
        assert_eq!(config.performance.min_parallel_rows, 64);
    }

    #[test]
    fn test_builder_rejects_negative_margin() {
        let err = ConfigBuilder::new().triplet(|t| t.margin = -0.5).build().unwrap_err();
        assert!(matches!(err, KernelError::ConfigurationError(_)));
    }

    #[test]
    fn test_margin_validation() {
        assert!(TripletLossConfig::new(0.0).validate().is_ok());
        assert!(TripletLossConfig::new(2.5).validate().is_ok());
        assert!(TripletLossConfig::new(-1e-6).validate().is_err());
        assert!(TripletLossConfig::new(f32::NAN).validate().is_err());
        assert!(TripletLossConfig::new(f32::INFINITY).validate().is_err());
    }

    #[test]
    fn test_config_manager_keeps_valid_state() {
        let mut manager = ConfigManager::new();
        assert_eq!(manager.get_config().triplet.margin, 1.0);

        manager.update_config(|c| c.triplet.margin = 0.3).unwrap();
        assert_eq!(manager.get_config().triplet.margin, 0.3);

        assert!(manager.update_config(|c| c.triplet.margin = -1.0).is_err());
        assert_eq!(manager.get_config().triplet.margin, 0.3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: KernelConfig = serde_json::from_str(r#"{"triplet": {"margin": 0.5}}"#).unwrap();
        assert_eq!(config.triplet.margin, 0.5);
        assert_eq!(config.performance, PerformanceConfig::default());
        assert_eq!(config.development.log_level, "info");
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("triplet_config.json");

        let mut writer = ConfigManager::new().with_config_file(config_path.clone());
        writer.update_config(|c| {
            c.triplet.margin = 0.75;
            c.performance.parallel = false;
        }).unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(&config_path).unwrap();

        let loaded = manager.get_config();
        assert_eq!(loaded.triplet.margin, 0.75);
        assert!(!loaded.performance.parallel);
    }

    #[test]
    fn test_load_rejects_invalid_margin() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("bad.json");
        std::fs::write(&config_path, r#"{"triplet": {"margin": -2.0}}"#).unwrap();

        let mut manager = ConfigManager::new();
        assert!(manager.load_from_file(&config_path).is_err());
        assert_eq!(manager.get_config().triplet.margin, 1.0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp_dir = tempdir().unwrap();
        let mut manager = ConfigManager::new();
        let err = manager.load_from_file(&temp_dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, KernelError::IoError(_)));
        assert!(err.is_recoverable());

        let garbage = temp_dir.path().join("garbage.json");
        std::fs::write(&garbage, "not json").unwrap();
        let err = manager.load_from_file(&garbage).unwrap_err();
        assert!(matches!(err, KernelError::SerializationError(_)));
    }

    #[test]
    fn test_parallel_threshold() {
        let perf = PerformanceConfig { parallel: true, min_parallel_rows: 10 };
        assert!(!perf.use_parallel(9));
        assert_eq!(perf.use_parallel(10), cfg!(feature = "parallel"));

        let serial = PerformanceConfig { parallel: false, min_parallel_rows: 0 };
        assert!(!serial.use_parallel(10_000));
    }
}
