//! Services: a module sub-directory holding `Start`, `Stop` and `Running` scripts.
use std::{
    fs,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
};
use sha2::{Digest, Sha256};
use strum::Display;
use tracing::{debug, info};

use crate::{
    error::{ErrorKind, ToolkitError},
    module::Module,
};

const START_SCRIPT: &str = "Start";
const STOP_SCRIPT: &str = "Stop";
const RUNNING_SCRIPT: &str = "Running";

/// Whether a service may be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceState {
    Enabled,
    Disabled,
}

/// Marker file whose presence disables a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Creates the marker and any missing parent directories.
    pub fn create(&self) -> Result<(), ToolkitError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, b"")?;
        Ok(())
    }

    /// Removes the marker. A missing marker is not an error.
    pub fn delete(&self) -> Result<(), ToolkitError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A service inside a module.
#[derive(Debug, Clone)]
pub struct Service<'a> {
    module: &'a Module,
    dir: String,
    args: Vec<String>,
    lock: LockFile,
}

impl<'a> Service<'a> {
    /// `dir` is relative to the module root; `args` are appended to every
    /// script invocation.
    pub fn new<I, S>(module: &'a Module, dir: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dir = dir.to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }

        let lock = LockFile::new(
            module
                .context()
                .services_dir()
                .join(module.name())
                .join(lock_name(module.root(), &dir)),
        );

        Self {
            module,
            dir,
            args: args.into_iter().map(Into::into).collect(),
            lock,
        }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    /// Service directory, always ending in `/`.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    pub fn state(&self) -> ServiceState {
        if self.lock.exists() {
            ServiceState::Disabled
        } else {
            ServiceState::Enabled
        }
    }

    pub fn enabled(&self) -> bool {
        self.state() == ServiceState::Enabled
    }

    fn argv(&self, script: &str) -> Vec<String> {
        std::iter::once(format!("{}{script}", self.dir))
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Starts the service. Unless `force` is set, a service that reports
    /// itself running is left alone. Returns whether `Start` was launched.
    pub fn start(&self, force: bool) -> Result<bool, ToolkitError> {
        if !force && self.running()? {
            debug!("Service {} already running", self);
            return Ok(false);
        }
        if !self.enabled() {
            return Err(ToolkitError::ServiceDisabled {
                service: self.to_string(),
            });
        }

        self.stop()?;
        info!("Starting service {}", self);
        self.module.run(&self.argv(START_SCRIPT), true)?;
        Ok(true)
    }

    /// Asks the `Running` script whether the service is up.
    ///
    /// A missing script, unparsable output or a launch failure all read as
    /// "not running".
    pub fn running(&self) -> Result<bool, ToolkitError> {
        match self.module.cap::<bool, _>(&self.argv(RUNNING_SCRIPT)) {
            Ok(running) => Ok(running),
            Err(err) => match err.kind() {
                ErrorKind::NotFound | ErrorKind::Decode | ErrorKind::Spawn => {
                    debug!("Treating service {} as stopped: {err}", self);
                    Ok(false)
                }
                _ => Err(err),
            },
        }
    }

    /// Runs the `Stop` script whatever the current state.
    pub fn stop(&self) -> Result<(), ToolkitError> {
        info!("Stopping service {}", self);
        self.module.run(&self.argv(STOP_SCRIPT), true)?;
        Ok(())
    }

    /// Disables the service, stopping it first when `stop` is set.
    pub fn disable(&self, stop: bool) -> Result<(), ToolkitError> {
        self.lock.create()?;
        info!("Disabled service {}", self);
        if stop {
            self.stop()?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Service<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module.name(), self.dir)
    }
}

/// Marker file name for the service at `dir` inside the module at `root`.
/// Distinct for every module root and directory, so same-named modules and
/// `svc/web` versus `svc_web` never share a marker.
fn lock_name(root: &Path, dir: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.as_os_str().as_encoded_bytes());
    hasher.update([0]);
    hasher.update(dir.trim_matches('/').as_bytes());
    format!("{}.disabled", hex::encode(hasher.finalize()))
}
