//! Daemon configuration file (TOML).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use open_g13_core::config::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

const APP_DIR: &str = "open-g13";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// hidraw node to open instead of the first G13 found.
    pub device_path: Option<String>,
    pub profiles_dir: Option<PathBuf>,
    pub macros_dir: Option<PathBuf>,
    /// Profile activated at startup.
    pub default_profile: String,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_path: None,
            profiles_dir: None,
            macros_dir: None,
            default_profile: "default".to_string(),
            log_filter: None,
            engine: EngineConfig::default(),
        }
    }
}

/// `~/.config/open-g13`, or `./open-g13` without a config dir.
fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl DaemonConfig {
    pub fn default_path() -> PathBuf {
        app_dir().join("config.toml")
    }

    /// Read `path` (or the default location). A missing file gives defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.profiles_dir
            .clone()
            .unwrap_or_else(|| app_dir().join("profiles"))
    }

    pub fn macros_dir(&self) -> PathBuf {
        self.macros_dir
            .clone()
            .unwrap_or_else(|| app_dir().join("macros"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(DaemonConfig::parse("").unwrap(), DaemonConfig::default());
    }

    #[test]
    fn nested_engine_tables() {
        let cfg = DaemonConfig::parse(
            r#"
            device_path = "/dev/hidraw3"
            default_profile = "fps"

            [engine]
            read_timeout_ms = 20

            [engine.decoder]
            dead_zone = 0.25

            [engine.reconnect]
            max_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device_path.as_deref(), Some("/dev/hidraw3"));
        assert_eq!(cfg.default_profile, "fps");
        assert_eq!(cfg.engine.read_timeout_ms, 20);
        assert_eq!(cfg.engine.decoder.dead_zone, 0.25);
        assert_eq!(cfg.engine.reconnect.max_ms, 1000);
        assert_eq!(cfg.engine.reconnect.initial_ms, 100);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg, DaemonConfig::default());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "engine = 3").unwrap();
        assert!(DaemonConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn explicit_dirs_win() {
        let cfg = DaemonConfig {
            profiles_dir: Some(PathBuf::from("/tmp/p")),
            ..DaemonConfig::default()
        };
        assert_eq!(cfg.profiles_dir(), PathBuf::from("/tmp/p"));
        assert!(cfg.macros_dir().ends_with("open-g13/macros"));
    }
}
