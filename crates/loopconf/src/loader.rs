//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, LoopConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// A config file as written: every key is optional so a file only overrides
/// what it mentions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default)]
    pub loopback: LoopbackLayer,
    #[serde(default)]
    pub log: LogLayer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopbackLayer {
    pub rate: Option<u32>,
    pub channels: Option<u32>,
    pub channel_map: Option<String>,
    pub latency_ms: Option<u32>,
    pub group: Option<String>,
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogLayer {
    pub level: Option<String>,
}

impl ConfigLayer {
    /// Overlay the keys present in this layer onto `config`.
    pub fn apply_to(self, config: &mut LoopConfig) {
        let lb = self.loopback;
        if let Some(v) = lb.rate {
            config.loopback.rate = v;
        }
        if let Some(v) = lb.channels {
            config.loopback.channels = v;
        }
        if let Some(v) = lb.channel_map {
            config.loopback.channel_map = Some(v);
        }
        if let Some(v) = lb.latency_ms {
            config.loopback.latency_ms = Some(v);
        }
        if let Some(v) = lb.group {
            config.loopback.group = Some(v);
        }
        if let Some(v) = lb.remote {
            config.loopback.remote = Some(v);
        }
        if let Some(v) = self.log.level {
            config.log.level = v;
        }
    }
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override. A missing CLI
/// path is still returned so that loading reports the error.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/pw-loopback/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("pw-loopback/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("pw-loopback.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load one config layer from a TOML file.
pub fn load_from_file(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<ConfigLayer, ConfigError> {
    toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply environment variable overrides to config.
///
/// `vars` is passed in rather than read here so callers (and tests) control
/// exactly which environment is consulted.
pub fn apply_env_overrides(
    config: &mut LoopConfig,
    vars: &[(String, String)],
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    let lookup = |name: &str| {
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    if let Some(v) = lookup("PW_LOOPBACK_RATE") {
        config.loopback.rate = parse_number("PW_LOOPBACK_RATE", v)?;
        sources.env_overrides.push("PW_LOOPBACK_RATE".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_CHANNELS") {
        config.loopback.channels = parse_number("PW_LOOPBACK_CHANNELS", v)?;
        sources.env_overrides.push("PW_LOOPBACK_CHANNELS".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_CHANNEL_MAP") {
        config.loopback.channel_map = Some(v.to_string());
        sources.env_overrides.push("PW_LOOPBACK_CHANNEL_MAP".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_LATENCY") {
        config.loopback.latency_ms = Some(parse_number("PW_LOOPBACK_LATENCY", v)?);
        sources.env_overrides.push("PW_LOOPBACK_LATENCY".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_GROUP") {
        config.loopback.group = Some(v.to_string());
        sources.env_overrides.push("PW_LOOPBACK_GROUP".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_REMOTE") {
        config.loopback.remote = Some(v.to_string());
        sources.env_overrides.push("PW_LOOPBACK_REMOTE".to_string());
    }
    if let Some(v) = lookup("PW_LOOPBACK_LOG_LEVEL") {
        config.log.level = v.to_string();
        sources.env_overrides.push("PW_LOOPBACK_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins over everything else for logging
    if let Some(v) = lookup("RUST_LOG") {
        config.log.level = v.to_string();
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    Ok(())
}

fn parse_number(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cli_path_is_always_returned() {
        let files = discover_config_files_with_override(Some(Path::new("/nonexistent/x.toml")));
        assert_eq!(files.last(), Some(&PathBuf::from("/nonexistent/x.toml")));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[loopback]
latency_ms = 20
"#;
        let layer = parse_toml(toml, Path::new("test.toml")).unwrap();
        let mut config = LoopConfig::default();
        layer.apply_to(&mut config);

        assert_eq!(config.loopback.latency_ms, Some(20));
        // Other values should be defaults
        assert_eq!(config.loopback.channels, 2);
        assert_eq!(config.loopback.rate, 48000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[loopback]
rate = 44100
channels = 1
channel_map = "[ MONO ]"
latency_ms = 10
group = "studio"
remote = "pipewire-1"

[log]
level = "debug"
"#;
        let layer = parse_toml(toml, Path::new("test.toml")).unwrap();
        let mut config = LoopConfig::default();
        layer.apply_to(&mut config);

        assert_eq!(config.loopback.rate, 44100);
        assert_eq!(config.loopback.channels, 1);
        assert_eq!(config.loopback.channel_map.as_deref(), Some("[ MONO ]"));
        assert_eq!(config.loopback.latency_ms, Some(10));
        assert_eq!(config.loopback.group.as_deref(), Some("studio"));
        assert_eq!(config.loopback.remote.as_deref(), Some("pipewire-1"));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = parse_toml("[loopback]\nchanels = 2\n", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_later_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");
        std::fs::File::create(&first)
            .unwrap()
            .write_all(b"[loopback]\nchannels = 4\ngroup = \"a\"\n")
            .unwrap();
        std::fs::File::create(&second)
            .unwrap()
            .write_all(b"[loopback]\ngroup = \"b\"\n")
            .unwrap();

        let (config, sources) = LoopConfig::load_layers(&[first, second], &[]).unwrap();
        assert_eq!(config.loopback.channels, 4);
        assert_eq!(config.loopback.group.as_deref(), Some("b"));
        assert_eq!(sources.files.len(), 2);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = LoopConfig::load_layers(&[PathBuf::from("/nonexistent/pw.toml")], &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LoopConfig::default();
        let mut sources = ConfigSources::default();
        let vars = env(&[
            ("PW_LOOPBACK_LATENCY", "20"),
            ("PW_LOOPBACK_GROUP", "env-group"),
            ("PW_LOOPBACK_LOG_LEVEL", "warn"),
            ("RUST_LOG", "pwloop=trace"),
            ("UNRELATED", "1"),
        ]);

        apply_env_overrides(&mut config, &vars, &mut sources).unwrap();

        assert_eq!(config.loopback.latency_ms, Some(20));
        assert_eq!(config.loopback.group.as_deref(), Some("env-group"));
        assert_eq!(config.log.level, "pwloop=trace");
        assert_eq!(sources.env_overrides.len(), 4);
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = LoopConfig::default();
        let mut sources = ConfigSources::default();
        let err = apply_env_overrides(
            &mut config,
            &env(&[("PW_LOOPBACK_CHANNELS", "two")]),
            &mut sources,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
