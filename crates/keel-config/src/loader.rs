//! Layered configuration loading
//!
//! Built-in defaults come first, then each file from [`Paths::layers`] that
//! exists, then `KEEL_*` environment variables. Later layers override single
//! keys, not whole sections. The merged result is validated before it is
//! returned.

use crate::{KeelConfig, Paths};
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Builds a [`KeelConfig`] from defaults, config files and the environment.
pub struct ConfigLoader {
    paths: Paths,
    env_prefix: String,
}

impl ConfigLoader {
    /// Loader for the current directory and the user's XDG config.
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            paths: Paths::for_project(cwd),
            env_prefix: "KEEL".to_string(),
        }
    }

    /// Read `keel.toml` and `keel.local.toml` from `dir`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let user = self.paths.user().map(Path::to_path_buf);
        self.paths = Paths::for_project(dir).with_user_file(user);
        self
    }

    /// Use `path` as the user config; `None` skips that layer.
    pub fn with_user_config(mut self, path: Option<PathBuf>) -> Self {
        self.paths = self.paths.with_user_file(path);
        self
    }

    /// Set the environment variable prefix (default: "KEEL")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Merge every layer and validate the result.
    pub fn load(self) -> Result<KeelConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&KeelConfig::default())?);

        for path in self.paths.layers().filter(|path| path.exists()) {
            tracing::debug!(path = %path.display(), "config file layered");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        // KEEL_KINETIC__NUM_CONNECTIONS: keys contain single underscores.
        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let merged: KeelConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .context("Failed to merge configuration")?;
        merged.validate()?;

        tracing::debug!(config = ?merged, "configuration loaded");
        Ok(merged)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    /// Loader over a fresh project directory with no user config.
    fn isolated() -> (TempDir, ConfigLoader) {
        let dir = tempdir().expect("Failed to create temp dir");
        let loader = ConfigLoader::new()
            .with_project_dir(dir.path())
            .with_user_config(None);
        (dir, loader)
    }

    #[test]
    fn test_load_defaults() {
        let (_dir, loader) = isolated();
        let config = loader.load().expect("Failed to load config");
        assert_eq!(config, KeelConfig::default());
    }

    #[test]
    fn test_project_config_overrides_single_keys() {
        let (dir, loader) = isolated();
        fs::write(
            dir.path().join("keel.toml"),
            "[kinetic]\nhost = \"10.0.0.7\"\nmax_batch_ops = 32\n\n[aio]\nmax_in_flight = 256\n",
        )
        .expect("Failed to write config");

        let config = loader.load().expect("Failed to load config");
        assert_eq!(config.kinetic.host, "10.0.0.7");
        assert_eq!(config.kinetic.max_batch_ops, 32);
        assert_eq!(config.aio.max_in_flight, 256);
        assert_eq!(config.kinetic.port, 8123);
        assert_eq!(config.aio.submit_retries, 10);
    }

    #[test]
    fn test_layer_precedence() {
        let (dir, loader) = isolated();
        let user_file = dir.path().join("user.toml");
        fs::write(&user_file, "[kinetic]\nhost = \"user\"\nport = 1\nuser_id = 9\n").unwrap();
        fs::write(dir.path().join("keel.toml"), "[kinetic]\nhost = \"project\"\nport = 2\n").unwrap();
        fs::write(dir.path().join("keel.local.toml"), "[kinetic]\nhost = \"local\"\n").unwrap();

        let config = loader
            .with_user_config(Some(user_file))
            .load()
            .expect("Failed to load config");
        assert_eq!(config.kinetic.host, "local");
        assert_eq!(config.kinetic.port, 2);
        assert_eq!(config.kinetic.user_id, 9);
    }

    #[test]
    fn test_project_dir_keeps_user_config() {
        let (dir, loader) = isolated();
        let user_file = dir.path().join("user.toml");
        let loader = loader
            .with_user_config(Some(user_file.clone()))
            .with_project_dir(dir.path().join("elsewhere"));
        assert_eq!(loader.paths().user(), Some(user_file.as_path()));
        assert_eq!(
            loader.paths().project(),
            dir.path().join("elsewhere").join("keel.toml")
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (dir, loader) = isolated();
        fs::write(dir.path().join("keel.toml"), "[kinetic]\nmax_batch_ops = 1\n").unwrap();

        let err = loader.load().expect_err("unbatched commits need an opt-in");
        assert!(format!("{err:#}").contains("max_batch_ops"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let (dir, loader) = isolated();
        fs::write(dir.path().join("keel.local.toml"), "[kinetic\nhost = ").unwrap();
        assert!(loader.load().is_err());
    }
}
