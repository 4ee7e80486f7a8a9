use crate::memorylimits::MemoryBudget;
use crate::search::DEFAULT_MAX_SPLIT_FACTOR;

use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroU8};
use std::path::{Path, PathBuf};

/// The hardware limit on planes moved by one DMA descriptor.
pub const DMA_MAX_NUMBER_PLANES: u32 = 256;
pub const DEFAULT_DMA_ENGINES: u8 = 2;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub budget: MemoryBudget,
    pub max_split_factor: u32,
    /// Plan operations so the next operation's inputs can be prefetched.
    pub enable_prefetch: bool,
    /// Leave operations which cannot be tiled in place instead of failing.
    pub allow_fallback: bool,
    /// Constant operands larger than this fraction of the capacity switch the search
    /// to the large-constant mode.
    pub large_constant_ratio: f64,
    pub dma: DmaConfig,
}

/// Raw DMA limits as written in a configuration file. See [DmaConfig::limits].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DmaConfig {
    pub max_planes: u32,
    pub engines: u8,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("DMA limit `{0}` must be positive")]
    InvalidDmaLimit(&'static str),
    #[error("Large-constant ratio {0} is outside (0, 1]")]
    InvalidRatio(f64),
    #[error("Budget {0} leaves no usable capacity")]
    InvalidBudget(MemoryBudget),
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            budget: MemoryBudget::default(),
            max_split_factor: DEFAULT_MAX_SPLIT_FACTOR,
            enable_prefetch: true,
            allow_fallback: true,
            large_constant_ratio: 0.5,
            dma: DmaConfig::default(),
        }
    }
}

impl Default for DmaConfig {
    fn default() -> Self {
        DmaConfig {
            max_planes: DMA_MAX_NUMBER_PLANES,
            engines: DEFAULT_DMA_ENGINES,
        }
    }
}

impl DmaConfig {
    pub fn limits(&self) -> Result<(NonZeroU32, NonZeroU8), ConfigError> {
        let max_planes =
            NonZeroU32::new(self.max_planes).ok_or(ConfigError::InvalidDmaLimit("max_planes"))?;
        let engines = NonZeroU8::new(self.engines).ok_or(ConfigError::InvalidDmaLimit("engines"))?;
        Ok((max_planes, engines))
    }
}

impl CompilerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates a configuration. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CompilerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.effective_capacity(self.enable_prefetch) == 0 {
            return Err(ConfigError::InvalidBudget(self.budget));
        }
        if !(self.large_constant_ratio > 0.0 && self.large_constant_ratio <= 1.0) {
            return Err(ConfigError::InvalidRatio(self.large_constant_ratio));
        }
        self.dma.limits()?;
        Ok(())
    }

    /// Bytes above which a constant operand counts as large.
    pub fn large_constant_threshold(&self) -> u64 {
        (self.budget.capacity as f64 * self.large_constant_ratio) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = CompilerConfig::from_json(r#"{"budget": {"capacity": 4096}}"#).unwrap();
        assert_eq!(config.budget.capacity, 4096);
        assert_eq!(config.budget.alignment, 64);
        assert_eq!(config.dma, DmaConfig::default());
        assert_eq!(config.max_split_factor, DEFAULT_MAX_SPLIT_FACTOR);
    }

    #[test]
    fn test_zero_dma_limits_are_rejected() {
        let err = CompilerConfig::from_json(r#"{"dma": {"engines": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDmaLimit("engines")));
        let err = CompilerConfig::from_json(r#"{"dma": {"max_planes": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDmaLimit("max_planes")));
    }

    #[test]
    fn test_unusable_budget_is_rejected() {
        let err = CompilerConfig::from_json(r#"{"budget": {"capacity": 64, "reserved": 64}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBudget(_)));
        // The reserve is only taken when prefetching.
        let text = r#"{"enable_prefetch": false, "budget": {"capacity": 64, "reserved": 64}}"#;
        assert_eq!(CompilerConfig::from_json(text).unwrap().budget.reserved, 64);
        let err = CompilerConfig::from_json(r#"{"budget": {"capacity": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBudget(_)));
        let err = CompilerConfig::from_json(r#"{"large_constant_ratio": 1.5}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRatio(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"enable_prefetch": false, "dma": {{"max_planes": 64}}}}"#).unwrap();
        let config = CompilerConfig::load(file.path()).unwrap();
        assert!(!config.enable_prefetch);
        assert_eq!(config.dma.limits().unwrap().0.get(), 64);
        assert!(matches!(
            CompilerConfig::load(&file.path().with_extension("missing")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = CompilerConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(CompilerConfig::from_json(&text).unwrap(), config);
    }
}
