//! Runtime configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/redcat/redcatrc.json` (or the path given
//! with `--config`); every field has a sensible default so the file is
//! optional. The plugin directory can additionally be overridden with the
//! `REDCAT_PLUGIN_PATH` environment variable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the plugin directory.
pub const PLUGIN_PATH_ENV: &str = "REDCAT_PLUGIN_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keystroke that quotes the next keystroke through to the remote
    /// session in raw mode. Default: Ctrl-K.
    pub prefix_key: u8,
    /// Keystroke that switches from raw pass-through back to the local
    /// prompt. Default: Ctrl-D (EOT).
    pub escape_key: u8,
    /// Default deadline, in seconds, applied to framed executions that do
    /// not specify their own. Zero disables the default deadline.
    pub command_timeout: u64,
    /// Report framed exit codes normalized to 0/1 instead of the remote's
    /// raw `$?` value.
    pub normalize_exit_status: bool,
    /// Directory holding the stage-one/stage-two payloads and .NET plugins.
    pub plugin_path: PathBuf,
    /// Directory holding the persisted target store.
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        let data_root = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Config {
            prefix_key: 0x0b, // Ctrl-K
            escape_key: 0x04, // Ctrl-D
            command_timeout: 0,
            normalize_exit_status: false,
            plugin_path: data_root.join("redcat").join("plugins"),
            data_path: data_root.join("redcat"),
        }
    }
}

impl Config {
    /// The default configuration file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("redcat").join("redcatrc.json"))
    }

    /// Load the configuration. A missing file yields the defaults; a
    /// malformed file is an error so typos do not silently disappear.
    pub fn load(path: Option<&Path>) -> std::io::Result<Config> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Config::default_path() {
                Some(p) => p,
                None => return Ok(Config::default()),
            },
        };

        let mut config: Config = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}: {}", path.display(), e),
                )
            })?,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };

        if let Ok(plugin_path) = std::env::var(PLUGIN_PATH_ENV) {
            config.plugin_path = PathBuf::from(plugin_path);
        }

        Ok(config)
    }

    /// Deadline to apply to a framed execution when the caller passed none.
    pub fn default_deadline(&self) -> Option<std::time::Duration> {
        if self.command_timeout == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.command_timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/redcatrc.json"))).unwrap();
        assert_eq!(config.escape_key, 0x04);
        assert_eq!(config.prefix_key, 0x0b);
        assert!(!config.normalize_exit_status);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.json");
        std::fs::write(&path, br#"{"normalize_exit_status": true}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.normalize_exit_status);
        assert_eq!(config.escape_key, 0x04);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let config = Config::default();
        assert!(config.default_deadline().is_none());
    }
}
