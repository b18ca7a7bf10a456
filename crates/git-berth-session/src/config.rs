//! Session tuning loaded from a per-repository configuration file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::watcher::DEFAULT_COALESCE_WINDOW;

/// File name looked up in the working tree root.
pub const CONFIG_FILE: &str = ".git-berth.toml";

fn default_coalesce_window_ms() -> u64 {
    DEFAULT_COALESCE_WINDOW
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

const fn default_notification_capacity() -> usize {
    64
}

const fn default_watch_workspace() -> bool {
    true
}

/// Errors raised while loading [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path of the unreadable file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the malformed file.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A configured value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for a repository session, loaded from `.git-berth.toml`.
///
/// Every field is optional in the file; omitted fields keep their defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_coalesce_window_ms")]
    coalesce_window_ms: u64,
    #[serde(default = "default_notification_capacity")]
    notification_capacity: usize,
    #[serde(default = "default_watch_workspace")]
    watch_workspace: bool,
    #[serde(default)]
    exclude: Vec<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: default_coalesce_window_ms(),
            notification_capacity: default_notification_capacity(),
            watch_workspace: default_watch_workspace(),
            exclude: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a known working tree directory.
    ///
    /// A missing file yields the defaults; a present file must parse and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// contains out-of-range values.
    pub fn load_or_default(workdir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = workdir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Coalescing window applied to workspace change batches.
    #[must_use]
    pub const fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Capacity of the notification broadcast channel.
    #[must_use]
    pub const fn notification_capacity(&self) -> usize {
        self.notification_capacity
    }

    /// Whether the working tree is watched in addition to the Git directory.
    #[must_use]
    pub const fn watch_workspace(&self) -> bool {
        self.watch_workspace
    }

    /// Workspace subpaths excluded from change reporting.
    #[must_use]
    pub fn exclude(&self) -> &[PathBuf] {
        &self.exclude
    }

    /// Replace the coalescing window.
    #[must_use]
    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window_ms = window.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable the working tree watcher.
    #[must_use]
    pub const fn with_workspace_watch(mut self, enabled: bool) -> Self {
        self.watch_workspace = enabled;
        self
    }

    /// Add a workspace subpath to exclude from change reporting.
    #[must_use]
    pub fn with_exclude(mut self, subpath: impl Into<PathBuf>) -> Self {
        self.exclude.push(subpath.into());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.coalesce_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "coalesce_window_ms must be greater than zero".into(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notification_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let cfg = SessionConfig::load_or_default(dir.path())?;
        assert_eq!(cfg.coalesce_window(), DEFAULT_COALESCE_WINDOW);
        assert_eq!(cfg.notification_capacity(), 64);
        assert!(cfg.watch_workspace());
        assert!(cfg.exclude().is_empty());
        Ok(())
    }

    #[test]
    fn file_overrides_only_named_fields() -> Result<()> {
        let dir = tempdir()?;
        let mut file = fs::File::create(dir.path().join(CONFIG_FILE))?;
        writeln!(
            file,
            "coalesce_window_ms = 50\nexclude = [\"target\", \"node_modules\"]"
        )?;

        let cfg = SessionConfig::load_or_default(dir.path())?;
        assert_eq!(cfg.coalesce_window(), Duration::from_millis(50));
        assert_eq!(cfg.notification_capacity(), 64);
        assert!(cfg.watch_workspace());
        assert_eq!(
            cfg.exclude(),
            [PathBuf::from("target"), PathBuf::from("node_modules")]
        );
        Ok(())
    }

    #[test]
    fn zero_window_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "coalesce_window_ms = 0\n")?;

        let Err(err) = SessionConfig::load_or_default(dir.path()) else {
            panic!("zero window should error");
        };
        assert!(err.to_string().contains("coalesce_window_ms"));
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "notification_capacity = 0\n")?;

        let Err(err) = SessionConfig::load_or_default(dir.path()) else {
            panic!("zero capacity should error");
        };
        assert!(err.to_string().contains("notification_capacity"));
        Ok(())
    }

    #[test]
    fn malformed_file_reports_parse_error() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "coalesce_window_ms = \"soon\"")?;

        let Err(err) = SessionConfig::load_or_default(dir.path()) else {
            panic!("malformed file should error");
        };
        assert!(matches!(err, ConfigError::Parse { .. }));
        Ok(())
    }

    #[test]
    fn builders_adjust_defaults() {
        let cfg = SessionConfig::default()
            .with_coalesce_window(Duration::from_millis(20))
            .with_workspace_watch(false)
            .with_exclude("build");
        assert_eq!(cfg.coalesce_window(), Duration::from_millis(20));
        assert!(!cfg.watch_workspace());
        assert_eq!(cfg.exclude(), [PathBuf::from("build")]);
    }
}
