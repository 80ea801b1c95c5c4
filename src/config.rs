//! Configuration management: module manifests and toolkit settings.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{error::ToolkitError, process::Interpreters, runtime::RuntimeDirs};

/// Name of the manifest file that turns a directory into a module.
pub const MANIFEST_FILE: &str = "module.yaml";

/// Contents of a module's `module.yaml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Gates `run`/`start`/`cap` on the module.
    pub enabled: bool,
    /// Python packages upgraded by `install`, in order.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Files whose changes are reported by the module's watcher.
    /// Entries starting with `/` are relative to the module root.
    #[serde(default)]
    pub watch_files: Vec<String>,
}

impl Manifest {
    /// Finds the manifest inside `dir`. An exact `module.yaml` wins; otherwise
    /// the first entry matching it case-insensitively (e.g. `Module.yaml`).
    pub fn locate(dir: &Path) -> Option<PathBuf> {
        let exact = dir.join(MANIFEST_FILE);
        if exact.is_file() {
            return Some(exact);
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        entries.into_iter().find(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.eq_ignore_ascii_case(MANIFEST_FILE))
        })
    }

    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Self, ToolkitError> {
        let content =
            fs::read_to_string(path).map_err(|source| ToolkitError::ManifestRead {
                path: path.to_path_buf(),
                source,
            })?;

        serde_yaml::from_str(&content).map_err(|source| ToolkitError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Toolkit-wide settings, read from `~/.config/modvisor/config.yaml` by default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Interpreter used for `.py` scripts and `python -m` invocations.
    pub python: String,
    /// Version-control executable used by `Module::git`.
    pub git: String,
    /// Prefix package installs with `sudo` when not already root.
    pub elevate: bool,
    /// Default directory searched by `scan`.
    pub module_root: Option<PathBuf>,
    /// Overrides where the var store and service locks live.
    pub state_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            python: default_python().to_string(),
            git: "git".to_string(),
            elevate: true,
            module_root: None,
            state_dir: None,
        }
    }
}

#[cfg(windows)]
fn default_python() -> &'static str {
    "python"
}

#[cfg(not(windows))]
fn default_python() -> &'static str {
    "python3"
}

impl Settings {
    /// Interpreter table handed to the process launcher.
    pub fn interpreters(&self) -> Interpreters {
        Interpreters {
            python: self.python.clone(),
        }
    }

    /// Effective state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| RuntimeDirs::from_env().state_dir)
    }
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ToolkitError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ToolkitError::SettingsRead(std::io::Error::other(err)))?;

    for caps in re.captures_iter(input) {
        let var_name = &caps[1];
        if env::var(var_name).is_err() {
            return Err(ToolkitError::MissingEnvVar(var_name.to_string()));
        }
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.to_string())
}

/// Loads the settings file, expanding environment variables.
///
/// With no explicit path, the default location is used when it exists and
/// built-in defaults otherwise.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ToolkitError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default_path = RuntimeDirs::from_env().settings_file();
            if !default_path.exists() {
                debug!("No settings file at {:?}; using defaults", default_path);
                return Ok(Settings::default());
            }
            default_path
        }
    };

    let content = fs::read_to_string(&path).map_err(|e| {
        ToolkitError::SettingsRead(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let settings: Settings = serde_yaml::from_str(&expanded)?;
    debug!("Loaded settings from {:?}: {:?}", path, settings);
    Ok(settings)
}
