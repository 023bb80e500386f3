//! Where Keel looks for configuration files

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// File name of the user config inside the XDG config directory.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Git-tracked project config.
pub const PROJECT_CONFIG_FILE: &str = "keel.toml";

/// Gitignored per-checkout overrides.
pub const LOCAL_CONFIG_FILE: &str = "keel.local.toml";

/// Config file candidates for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    user: Option<PathBuf>,
    project: PathBuf,
    local: PathBuf,
}

impl Paths {
    /// Resolves the candidates for `project_dir`. There is no user file when
    /// the platform has no home directory.
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        let dir = project_dir.as_ref();
        Self {
            user: user_config_dir()
                .ok()
                .map(|dir| dir.join(USER_CONFIG_FILE)),
            project: dir.join(PROJECT_CONFIG_FILE),
            local: dir.join(LOCAL_CONFIG_FILE),
        }
    }

    /// Replaces the user config file; `None` skips that layer.
    #[must_use]
    pub fn with_user_file(mut self, path: Option<PathBuf>) -> Self {
        self.user = path;
        self
    }

    pub fn user(&self) -> Option<&Path> {
        self.user.as_deref()
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    /// Every candidate, lowest precedence first.
    pub fn layers(&self) -> impl Iterator<Item = &Path> {
        self.user()
            .into_iter()
            .chain([self.project(), self.local()])
    }
}

/// Keel's XDG config directory (`~/.config/keel` on Linux).
pub fn user_config_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("com", "Keel", "keel")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| ConfigError::XdgError("no home directory for user config".to_string()))
}
