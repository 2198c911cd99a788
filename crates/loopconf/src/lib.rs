//! Layered default configuration for pw-loopback.
//!
//! Command-line flags always win, but every tunable the loopback tool exposes
//! can also be seeded from configuration files and the environment, so a
//! studio machine can pin its group name or latency once.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/pw-loopback/config.toml` (system)
//! 2. `~/.config/pw-loopback/config.toml` (user)
//! 3. `./pw-loopback.toml` (local override), or the `--config` path instead
//! 4. Environment variables (`PW_LOOPBACK_*`, `RUST_LOG`)
//!
//! Nothing is ever written back.
//!
//! # Example Config
//!
//! ```toml
//! [loopback]
//! rate = 48000
//! channels = 2
//! channel_map = "[ FL, FR ]"
//! latency_ms = 20
//! group = "studio-loop"
//!
//! [log]
//! level = "debug"
//! ```

pub mod loader;

pub use loader::{discover_config_files_with_override, ConfigSources};

use std::path::PathBuf;
use thiserror::Error;

/// Rate used for latency arithmetic when nothing else is configured.
pub const DEFAULT_RATE: u32 = 48000;
/// Channel count used when nothing else is configured.
pub const DEFAULT_CHANNELS: u32 = 2;
/// Channel map used when nothing else is configured.
pub const DEFAULT_CHANNEL_MAP: &str = "[ FL, FR ]";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Defaults for the loopback streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackDefaults {
    /// Rate used to convert a millisecond latency target into frames.
    pub rate: u32,
    pub channels: u32,
    /// Explicit layout; `None` adopts the default map when the channel count
    /// matches it and unknown positions otherwise.
    pub channel_map: Option<String>,
    /// Latency target in milliseconds; `None` lets the daemon decide.
    pub latency_ms: Option<u32>,
    /// Node group; `None` means `argv[0]-<pid>`.
    pub group: Option<String>,
    /// Daemon instance to connect to; `None` means the default instance.
    pub remote: Option<String>,
}

impl Default for LoopbackDefaults {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            channels: DEFAULT_CHANNELS,
            channel_map: None,
            latency_ms: None,
            group: None,
            remote: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `pwloop=debug`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete pw-loopback configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoopConfig {
    pub loopback: LoopbackDefaults,
    pub log: LogConfig,
}

impl LoopConfig {
    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let vars: Vec<(String, String)> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::load_layers(&files, &vars)
    }

    /// Fold the given files and environment pairs over the compiled defaults.
    pub fn load_layers(
        files: &[PathBuf],
        vars: &[(String, String)],
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = LoopConfig::default();

        for path in files {
            let layer = loader::load_from_file(path)?;
            layer.apply_to(&mut config);
            sources.files.push(path.clone());
        }

        loader::apply_env_overrides(&mut config, vars, &mut sources)?;

        Ok((config, sources))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoopConfig::default();
        assert_eq!(config.loopback.rate, 48000);
        assert_eq!(config.loopback.channels, 2);
        assert_eq!(config.loopback.channel_map, None);
        assert_eq!(config.loopback.latency_ms, None);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_path_is_the_last_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.toml");
        std::fs::write(&path, "[loopback]\nchannels = 6\ngroup = \"from-file\"\n").unwrap();

        let (config, sources) = LoopConfig::load_with_sources_from(Some(&path)).unwrap();
        assert_eq!(sources.files.last(), Some(&path));
        assert_eq!(config.loopback.channels, 6);
        assert_eq!(config.loopback.group.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_load_layers_without_files() {
        let (config, sources) = LoopConfig::load_layers(&[], &[]).unwrap();
        assert_eq!(config, LoopConfig::default());
        assert!(sources.files.is_empty());
        assert!(sources.env_overrides.is_empty());
    }
}
