//! Modules: directories of scripts described by a `module.yaml` manifest.
use serde::de::DeserializeOwned;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    codec,
    config::Manifest,
    context::Context,
    error::ToolkitError,
    process::{LaunchMode, LaunchSpec, ManagedProcess},
    watch::{ChangeWatcher, WatchFile, when_modified},
};

/// Affinity set size for scripts launched from a module.
pub const MODULE_CORES: usize = 3;

/// A validated module directory.
#[derive(Debug, Clone)]
pub struct Module {
    root: PathBuf,
    name: String,
    manifest: Manifest,
    watch_files: Vec<WatchFile>,
    context: Context,
}

impl Module {
    /// Opens the module at `path` with a default [`Context`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ToolkitError> {
        Self::open_with(path, Context::default())
    }

    /// Opens the module at `path`, launching through `context`.
    ///
    /// Watch files are registered (and their mtimes persisted) here.
    pub fn open_with(path: impl AsRef<Path>, context: Context) -> Result<Self, ToolkitError> {
        let path = path.as_ref();
        let not_found = || ToolkitError::ModuleNotFound {
            path: path.to_path_buf(),
        };

        if !path.is_dir() {
            return Err(not_found());
        }
        let root = fs::canonicalize(path).map_err(|_| not_found())?;
        let manifest_path = Manifest::locate(&root).ok_or_else(not_found)?;
        let manifest = Manifest::load(&manifest_path)?;

        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        let watch_files = manifest
            .watch_files
            .iter()
            .map(|file| WatchFile::new(&root, file, &context.store))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Opened module '{name}' at {} (enabled: {})",
            root.display(),
            manifest.enabled
        );

        Ok(Self {
            root,
            name,
            manifest,
            watch_files,
            context,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory basename.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.manifest.enabled
    }

    pub fn packages(&self) -> &[String] {
        &self.manifest.packages
    }

    pub fn watch_files(&self) -> &[WatchFile] {
        &self.watch_files
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Finds a file by name, ignoring its extension and letter case.
    ///
    /// Segments may contain `/`. Everything but the final name selects a
    /// sub-directory of the module root; the first file (by sorted name) whose
    /// stem matches the final name wins.
    pub fn resolve_file<S: AsRef<str>>(&self, segments: &[S]) -> Result<PathBuf, ToolkitError> {
        let parts: Vec<&str> = segments
            .iter()
            .flat_map(|segment| segment.as_ref().split('/'))
            .filter(|part| !part.is_empty())
            .collect();

        let Some((name, dirs)) = parts.split_last() else {
            return Err(ToolkitError::FileNotFound {
                pattern: format!("{}/*", self.root.display()),
            });
        };

        let dir = dirs.iter().fold(self.root.clone(), |dir, part| dir.join(part));
        let not_found = || ToolkitError::FileNotFound {
            pattern: format!("{}/{name}.*", dir.display()),
        };

        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|_| not_found())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        let wanted = name.to_lowercase();
        entries
            .into_iter()
            .find(|path| {
                path.is_file()
                    && path
                        .file_stem()
                        .is_some_and(|stem| stem.to_string_lossy().to_lowercase() == wanted)
            })
            .ok_or_else(not_found)
    }

    /// Runs a module script to completion. `args[0]` names the script.
    pub fn run<S: AsRef<str>>(&self, args: &[S], hide: bool) -> Result<ManagedProcess, ToolkitError> {
        self.launch(args, hide, true, None)
    }

    /// Starts a module script without waiting for it.
    pub fn start<S: AsRef<str>>(
        &self,
        args: &[S],
        hide: bool,
    ) -> Result<ManagedProcess, ToolkitError> {
        self.launch(args, hide, false, None)
    }

    /// Like [`Module::start`], but the supervisor kills the script once it
    /// has run for `timeout`.
    pub fn start_with<S: AsRef<str>>(
        &self,
        args: &[S],
        hide: bool,
        timeout: Option<Duration>,
    ) -> Result<ManagedProcess, ToolkitError> {
        self.launch(args, hide, false, timeout)
    }

    /// Runs a script hidden and parses its stdout as JSON.
    pub fn cap<T: DeserializeOwned, S: AsRef<str>>(&self, args: &[S]) -> Result<T, ToolkitError> {
        self.run(args, true)?.output_json()
    }

    fn launch<S: AsRef<str>>(
        &self,
        args: &[S],
        hide: bool,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<ManagedProcess, ToolkitError> {
        if !self.manifest.enabled {
            return Err(ToolkitError::ModuleDisabled {
                path: self.root.clone(),
            });
        }

        let (target, rest) = args.split_first().ok_or_else(|| ToolkitError::FileNotFound {
            pattern: format!("{}/*", self.root.display()),
        })?;
        let path = self.resolve_file(&[target.as_ref()])?;

        let mut argv = vec![path.to_string_lossy().into_owned()];
        let extension = path.extension().and_then(|ext| ext.to_str());
        if LaunchMode::from_extension(extension) == LaunchMode::Python {
            argv.push(codec::encode_args(rest));
        } else {
            argv.extend(rest.iter().map(|arg| arg.as_ref().to_string()));
        }

        debug!("Module '{}' launching {}", self.name, path.display());
        let mut spec = LaunchSpec::new(argv)
            .hide(hide)
            .wait(wait)
            .cores(MODULE_CORES);
        if let Some(timeout) = timeout {
            spec = spec.timeout(timeout);
        }
        self.context.launcher.launch(spec, &self.context.console)
    }

    /// Runs the configured git executable in the module root and waits for it.
    pub fn git<S: AsRef<str>>(&self, args: &[S], hide: bool) -> Result<ManagedProcess, ToolkitError> {
        let argv = std::iter::once(self.context.settings.git.clone())
            .chain(args.iter().map(|arg| arg.as_ref().to_string()));
        let spec = LaunchSpec::new(argv)
            .mode(LaunchMode::Shell)
            .working_dir(&self.root)
            .hide(hide)
            .wait(true);
        self.context.launcher.launch(spec, &self.context.console)
    }

    /// Initialises version control, then upgrades every declared package in
    /// order. Stops at the first package that fails.
    pub fn install(&self, hide: bool) -> Result<(), ToolkitError> {
        info!("Installing module '{}'", self.name);

        let git = self.git(&["init"], hide)?;
        if git.exit_code() != Some(0) {
            warn!(
                "`git init` in {} exited with {:?}",
                self.root.display(),
                git.exit_code()
            );
        }

        for package in &self.manifest.packages {
            info!("Installing package '{package}'");
            let spec = LaunchSpec::new(["pip", "install", "--upgrade", package.as_str()])
                .mode(LaunchMode::PythonModule)
                .elevated(self.context.settings.elevate)
                .hide(hide)
                .wait(true);
            let process = self.context.launcher.launch(spec, &self.context.console)?;

            let code = process.exit_code();
            if code != Some(0) {
                return Err(ToolkitError::InstallFailed {
                    package: package.clone(),
                    code,
                });
            }
        }
        Ok(())
    }

    /// Endless iterator over this module's changed watch files.
    pub fn watch(&self) -> ChangeWatcher {
        when_modified(&[self])
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

/// Modules found directly under `root`, in name order.
///
/// Entries that are not modules are skipped; any other failure to open a
/// module is yielded as an error.
pub fn scan(
    root: &Path,
    context: &Context,
) -> Result<impl Iterator<Item = Result<Module, ToolkitError>>, ToolkitError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let context = context.clone();
    Ok(dirs
        .into_iter()
        .filter_map(move |dir| match Module::open_with(&dir, context.clone()) {
            Ok(module) => Some(Ok(module)),
            Err(ToolkitError::ModuleNotFound { .. }) => {
                debug!("Skipping {}: not a module", dir.display());
                None
            }
            Err(err) => Some(Err(err)),
        }))
}
