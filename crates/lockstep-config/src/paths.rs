//! Where lockstep looks for configuration files.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Project-wide settings, checked into version control.
pub const PROJECT_CONFIG_FILE: &str = "lockstep.toml";

/// Per-checkout overrides of [`PROJECT_CONFIG_FILE`].
pub const LOCAL_CONFIG_FILE: &str = "lockstep.local.toml";

/// File name inside the user config directory.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Config file locations for one project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    project_dir: PathBuf,
    user_dir: Option<PathBuf>,
}

impl Paths {
    /// Locations under `project_dir`, with the user directory taken from
    /// the platform convention (`$XDG_CONFIG_HOME/lockstep` on Linux).
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            user_dir: ProjectDirs::from("", "", "lockstep")
                .map(|dirs| dirs.config_dir().to_path_buf()),
        }
    }

    /// Replaces the user config directory, e.g. with a temp dir in tests.
    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn user_config_dir(&self) -> Result<&Path, ConfigError> {
        self.user_dir.as_deref().ok_or_else(|| {
            ConfigError::XdgError("no home directory to place lockstep config in".to_string())
        })
    }

    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join(USER_CONFIG_FILE))
    }

    pub fn project_config_file(&self) -> PathBuf {
        self.project_dir.join(PROJECT_CONFIG_FILE)
    }

    pub fn local_config_file(&self) -> PathBuf {
        self.project_dir.join(LOCAL_CONFIG_FILE)
    }

    /// Candidate files, lowest precedence first. Existence is not checked.
    pub fn candidates(&self, include_user: bool) -> Vec<PathBuf> {
        let user = include_user
            .then(|| self.user_config_file().ok())
            .flatten();
        user.into_iter()
            .chain([self.project_config_file(), self.local_config_file()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_platform_user_dir_is_named_after_lockstep() {
        let paths = Paths::new(".");

        // Platform dependent, but must never panic
        if let Ok(file) = paths.user_config_file() {
            assert!(file.to_string_lossy().contains("lockstep"));
            assert!(file.ends_with(USER_CONFIG_FILE));
        }
    }

    #[test]
    fn test_candidates_in_precedence_order() {
        let project = tempdir().expect("Failed to create temp dir");
        let home = tempdir().expect("Failed to create temp dir");
        let paths = Paths::new(project.path()).with_user_dir(home.path());

        assert_eq!(paths.project_dir(), project.path());
        assert_eq!(
            paths.candidates(true),
            vec![
                home.path().join("config.toml"),
                project.path().join("lockstep.toml"),
                project.path().join("lockstep.local.toml"),
            ]
        );
        assert_eq!(paths.candidates(false).len(), 2);
    }
}
