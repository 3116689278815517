//! Transfer cache configuration
//!
//! Budgets can be set programmatically, from environment variables, or from a
//! TOML file. Environment values are in megabytes. A file may give each budget
//! in megabytes (`*_cache_mb`) or in bytes (`*_cache_bytes`), not both. The
//! in-memory configuration is in bytes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::memory_coordinator::MemoryState;

const MB: usize = 1024 * 1024;

/// Default budget for regular devices
pub const DEFAULT_NORMAL_LIMIT: usize = 128 * MB;
/// Default budget for low-end devices
pub const DEFAULT_LOW_END_LIMIT: usize = 4 * MB;
/// Default largest image edge accepted by the decoder
pub const DEFAULT_MAX_TEXTURE_SIZE: u32 = 16384;

/// Configuration for a [`ServiceTransferCache`](crate::ServiceTransferCache)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCacheConfig {
    /// Byte budget in the normal memory state
    pub normal_limit: usize,
    /// Byte budget in the normal memory state on low-end devices
    pub low_end_limit: usize,
    /// Whether this device is classified as low-end
    pub low_end_device: bool,
    /// Largest image width or height accepted when decoding
    pub max_texture_size: u32,
}

impl Default for TransferCacheConfig {
    fn default() -> Self {
        Self {
            normal_limit: DEFAULT_NORMAL_LIMIT,
            low_end_limit: DEFAULT_LOW_END_LIMIT,
            low_end_device: false,
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
        }
    }
}

impl TransferCacheConfig {
    /// Configuration with explicit byte budgets
    pub fn new(normal_limit: usize, low_end_limit: usize) -> Self {
        Self {
            normal_limit,
            low_end_limit,
            ..Default::default()
        }
    }

    pub fn with_normal_mb(mut self, mb: usize) -> Self {
        self.normal_limit = mb * MB;
        self
    }

    pub fn with_low_end_mb(mut self, mb: usize) -> Self {
        self.low_end_limit = mb * MB;
        self
    }

    pub fn with_low_end_device(mut self, low_end: bool) -> Self {
        self.low_end_device = low_end;
        self
    }

    pub fn with_max_texture_size(mut self, size: u32) -> Self {
        self.max_texture_size = size;
        self
    }

    /// Budget for the device class, before memory state is applied
    pub fn base_limit(&self) -> usize {
        if self.low_end_device {
            self.low_end_limit
        } else {
            self.normal_limit
        }
    }

    /// Byte budget for a memory state.
    ///
    /// # Panics
    ///
    /// Panics on [`MemoryState::Unknown`], which must never be delivered.
    pub fn limit_for_state(&self, state: MemoryState) -> usize {
        match state {
            MemoryState::Normal => self.base_limit(),
            MemoryState::Throttled => self.base_limit() / 2,
            MemoryState::Suspended => 0,
            MemoryState::Unknown => panic!("memory state must be known to size the transfer cache"),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRANSFER_CACHE_NORMAL_MB`: normal budget in MB (default: 128)
    /// - `TRANSFER_CACHE_LOW_END_MB`: low-end budget in MB (default: 4)
    /// - `TRANSFER_CACHE_LOW_END_DEVICE`: `true`/`false`, `1`/`0`
    /// - `TRANSFER_CACHE_MAX_TEXTURE_SIZE`: largest image edge in pixels
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_value::<usize>("TRANSFER_CACHE_NORMAL_MB")? {
            config.normal_limit = mb_to_bytes("TRANSFER_CACHE_NORMAL_MB", mb)?;
        }
        if let Some(mb) = env_value::<usize>("TRANSFER_CACHE_LOW_END_MB")? {
            config.low_end_limit = mb_to_bytes("TRANSFER_CACHE_LOW_END_MB", mb)?;
        }
        if let Ok(value) = std::env::var("TRANSFER_CACHE_LOW_END_DEVICE") {
            config.low_end_device = match value.trim() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "TRANSFER_CACHE_LOW_END_DEVICE".to_string(),
                    ))
                }
            };
        }
        if let Some(size) = env_value::<u32>("TRANSFER_CACHE_MAX_TEXTURE_SIZE")? {
            config.max_texture_size = size;
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (all keys optional):
    /// ```toml
    /// normal_cache_mb = 128
    /// low_end_cache_mb = 4
    /// low_end_device = false
    /// max_texture_size = 16384
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let defaults = Self::default();

        Ok(Self {
            normal_limit: file_limit(
                "normal_cache",
                file.normal_cache_mb,
                file.normal_cache_bytes,
            )?
            .unwrap_or(defaults.normal_limit),
            low_end_limit: file_limit(
                "low_end_cache",
                file.low_end_cache_mb,
                file.low_end_cache_bytes,
            )?
            .unwrap_or(defaults.low_end_limit),
            low_end_device: file.low_end_device.unwrap_or(defaults.low_end_device),
            max_texture_size: file.max_texture_size.unwrap_or(defaults.max_texture_size),
        })
    }

    /// Saves configuration to a TOML file.
    ///
    /// Budgets that are a whole number of megabytes are written in
    /// megabytes, anything else in bytes.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let (normal_cache_mb, normal_cache_bytes) = split_limit(self.normal_limit);
        let (low_end_cache_mb, low_end_cache_bytes) = split_limit(self.low_end_limit);
        let file = ConfigFile {
            normal_cache_mb,
            normal_cache_bytes,
            low_end_cache_mb,
            low_end_cache_bytes,
            low_end_device: Some(self.low_end_device),
            max_texture_size: Some(self.max_texture_size),
        };
        Ok(toml::to_string(&file)?)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    normal_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normal_cache_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    low_end_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    low_end_cache_bytes: Option<usize>,
    low_end_device: Option<bool>,
    max_texture_size: Option<u32>,
}

fn env_value<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

fn mb_to_bytes(key: &str, mb: usize) -> Result<usize, ConfigError> {
    mb.checked_mul(MB)
        .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
}

fn file_limit(
    key: &str,
    mb: Option<usize>,
    bytes: Option<usize>,
) -> Result<Option<usize>, ConfigError> {
    match (mb, bytes) {
        (Some(_), Some(_)) => Err(ConfigError::InvalidValue(format!(
            "{key}_mb and {key}_bytes are mutually exclusive"
        ))),
        (Some(mb), None) => mb_to_bytes(&format!("{key}_mb"), mb).map(Some),
        (None, bytes) => Ok(bytes),
    }
}

/// Splits a byte budget into its file form: megabytes when exact, else bytes.
fn split_limit(limit: usize) -> (Option<usize>, Option<usize>) {
    if limit % MB == 0 {
        (Some(limit / MB), None)
    } else {
        (None, Some(limit))
    }
}

/// Errors that can occur while loading or saving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to write configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: [&str; 4] = [
        "TRANSFER_CACHE_NORMAL_MB",
        "TRANSFER_CACHE_LOW_END_MB",
        "TRANSFER_CACHE_LOW_END_DEVICE",
        "TRANSFER_CACHE_MAX_TEXTURE_SIZE",
    ];

    #[test]
    fn test_default_config() {
        let config = TransferCacheConfig::default();
        assert_eq!(config.normal_limit, 128 * MB);
        assert_eq!(config.low_end_limit, 4 * MB);
        assert!(!config.low_end_device);
        assert_eq!(config.max_texture_size, 16384);
    }

    #[test]
    fn test_limits_per_state() {
        let config = TransferCacheConfig::default();
        assert_eq!(config.limit_for_state(MemoryState::Normal), 128 * MB);
        assert_eq!(config.limit_for_state(MemoryState::Throttled), 64 * MB);
        assert_eq!(config.limit_for_state(MemoryState::Suspended), 0);

        let low_end = config.with_low_end_device(true);
        assert_eq!(low_end.limit_for_state(MemoryState::Normal), 4 * MB);
        assert_eq!(low_end.limit_for_state(MemoryState::Throttled), 2 * MB);
        assert_eq!(low_end.limit_for_state(MemoryState::Suspended), 0);
    }

    #[test]
    #[should_panic(expected = "memory state must be known")]
    fn test_unknown_state_panics() {
        TransferCacheConfig::default().limit_for_state(MemoryState::Unknown);
    }

    #[test]
    fn test_builder_methods() {
        let config = TransferCacheConfig::default()
            .with_normal_mb(64)
            .with_low_end_mb(8)
            .with_low_end_device(true)
            .with_max_texture_size(4096);

        assert_eq!(config.normal_limit, 64 * MB);
        assert_eq!(config.low_end_limit, 8 * MB);
        assert!(config.low_end_device);
        assert_eq!(config.max_texture_size, 4096);
        assert_eq!(config.base_limit(), 8 * MB);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("TRANSFER_CACHE_NORMAL_MB", "32");
        env::set_var("TRANSFER_CACHE_LOW_END_MB", "2");
        env::set_var("TRANSFER_CACHE_LOW_END_DEVICE", "true");
        env::set_var("TRANSFER_CACHE_MAX_TEXTURE_SIZE", "2048");

        let config = TransferCacheConfig::from_env().unwrap();
        assert_eq!(config.normal_limit, 32 * MB);
        assert_eq!(config.low_end_limit, 2 * MB);
        assert!(config.low_end_device);
        assert_eq!(config.max_texture_size, 2048);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);
        for name in ENV_VARS {
            env::remove_var(name);
        }
        env::set_var("TRANSFER_CACHE_LOW_END_DEVICE", "1");

        let config = TransferCacheConfig::from_env().unwrap();
        assert!(config.low_end_device);
        assert_eq!(config.normal_limit, DEFAULT_NORMAL_LIMIT);
        assert_eq!(config.low_end_limit, DEFAULT_LOW_END_LIMIT);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);
        for name in ENV_VARS {
            env::remove_var(name);
        }

        env::set_var("TRANSFER_CACHE_NORMAL_MB", "lots");
        assert!(matches!(
            TransferCacheConfig::from_env(),
            Err(ConfigError::InvalidValue(key)) if key == "TRANSFER_CACHE_NORMAL_MB"
        ));

        env::remove_var("TRANSFER_CACHE_NORMAL_MB");
        env::set_var("TRANSFER_CACHE_LOW_END_DEVICE", "maybe");
        assert!(TransferCacheConfig::from_env().is_err());
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            # Transfer cache budgets
            normal_cache_mb = 256
            low_end_cache_mb = 16
            low_end_device = true
        "#;

        let config = TransferCacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.normal_limit, 256 * MB);
        assert_eq!(config.low_end_limit, 16 * MB);
        assert!(config.low_end_device);
        assert_eq!(config.max_texture_size, DEFAULT_MAX_TEXTURE_SIZE);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(matches!(
            TransferCacheConfig::from_toml("gpu_cache_mb = 12"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = TransferCacheConfig::default()
            .with_normal_mb(96)
            .with_low_end_mb(6)
            .with_max_texture_size(8192);
        let toml = config.to_toml().unwrap();
        assert_eq!(TransferCacheConfig::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_toml_roundtrip_keeps_unaligned_budgets() {
        let config = TransferCacheConfig::new(1536 * 1024, 1000);
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("normal_cache_bytes = 1572864"));
        assert!(toml.contains("low_end_cache_bytes = 1000"));
        assert!(!toml.contains("normal_cache_mb"));

        let back = TransferCacheConfig::from_toml(&toml).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.limit_for_state(MemoryState::Normal), 1536 * 1024);
    }

    #[test]
    fn test_from_toml_byte_budgets() {
        let toml = "normal_cache_bytes = 4096\nlow_end_cache_mb = 1";
        let config = TransferCacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.normal_limit, 4096);
        assert_eq!(config.low_end_limit, MB);
    }

    #[test]
    fn test_from_toml_rejects_both_units() {
        assert!(matches!(
            TransferCacheConfig::from_toml("normal_cache_mb = 1\nnormal_cache_bytes = 10"),
            Err(ConfigError::InvalidValue(message)) if message.contains("normal_cache_mb")
        ));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer_cache.toml");

        let config = TransferCacheConfig::default().with_low_end_device(true);
        config.save_to_file(&path).unwrap();

        assert_eq!(TransferCacheConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TransferCacheConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
