//! Default on-disk locations for state and configuration.
use std::{env, path::PathBuf};

/// Directory layout rooted at a user's home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDirs {
    /// Var store and service lock files (`~/.local/share/modvisor`).
    pub state_dir: PathBuf,
    /// Settings search location (`~/.config/modvisor`).
    pub config_dir: PathBuf,
}

impl RuntimeDirs {
    /// Resolves directories from `$HOME`, falling back to `/` when it is unset.
    pub fn from_env() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_home(home)
    }

    /// Resolves directories under an explicit home directory.
    pub fn from_home(home: PathBuf) -> Self {
        Self {
            state_dir: home.join(".local/share/modvisor"),
            config_dir: home.join(".config/modvisor"),
        }
    }

    /// Default settings file path.
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("config.yaml")
    }
}
