//! Error handling for modvisor.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors raised by modules, services and managed processes.
#[derive(Debug, Error)]
pub enum ToolkitError {
    /// The path is not a directory or carries no `module.yaml`.
    #[error("Module not found: {}", path.display())]
    ModuleNotFound {
        /// The directory that was expected to be a module.
        path: PathBuf,
    },

    /// No file in the searched directory matched the requested name.
    #[error("File not found: {pattern}")]
    FileNotFound {
        /// Human-readable glob of what was searched for (e.g. `/mods/a/sub/run.*`).
        pattern: String,
    },

    /// A disabled module was asked to run something.
    #[error("Module is disabled: {}", path.display())]
    ModuleDisabled {
        /// Root directory of the disabled module.
        path: PathBuf,
    },

    /// A disabled service was asked to start.
    #[error("Service is disabled: {service}")]
    ServiceDisabled {
        /// Module-relative service directory.
        service: String,
    },

    /// Captured output could not be decoded in the requested format.
    #[error("Failed to decode process output: {0}")]
    Decode(#[from] DecodeError),

    /// The OS refused to launch the process.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// The resolved command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A package install exited unsuccessfully.
    #[error("Installing `{package}` failed with exit code {code:?}")]
    InstallFailed {
        /// The package being installed.
        package: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
    },

    /// Error reading a module manifest.
    #[error("Failed to read manifest {}: {source}", path.display())]
    ManifestRead {
        /// Manifest location.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a module manifest.
    #[error("Invalid manifest {}: {source}", path.display())]
    ManifestParse {
        /// Manifest location.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_yaml::Error,
    },

    /// Error reading the toolkit settings file.
    #[error("Failed to read config file: {0}")]
    SettingsRead(std::io::Error),

    /// Error parsing the toolkit settings file.
    #[error("Invalid YAML format: {0}")]
    SettingsParse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the settings file has no value.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Error from the persistent variable store.
    #[error("Variable store error: {0}")]
    Store(#[from] StoreError),

    /// Any other filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Coarse classification of [`ToolkitError`], used where callers need to react
/// to a family of failures rather than a single variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Disabled,
    Decode,
    Spawn,
    Other,
}

impl ToolkitError {
    /// Returns the family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolkitError::ModuleNotFound { .. } | ToolkitError::FileNotFound { .. } => {
                ErrorKind::NotFound
            }
            ToolkitError::ModuleDisabled { .. } | ToolkitError::ServiceDisabled { .. } => {
                ErrorKind::Disabled
            }
            ToolkitError::Decode(_) => ErrorKind::Decode,
            ToolkitError::Spawn { .. } => ErrorKind::Spawn,
            _ => ErrorKind::Other,
        }
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ToolkitError`.
impl<T> From<std::sync::PoisonError<T>> for ToolkitError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ToolkitError::MutexPoisonError(err.to_string())
    }
}

/// Error type for decoding captured output and packed arguments.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Text was not valid JSON (or not the expected shape).
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Text was not valid hexadecimal.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Hex decoded to bytes that are not UTF-8.
    #[error("decoded bytes are not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// No packed argument was passed to the current process.
    #[error("no packed argument found on the command line")]
    MissingArgument,
}

/// Error type for the persistent variable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error reading or writing a variable file.
    #[error("Failed to access variable file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON contents of a variable file.
    #[error("Failed to parse variable file: {0}")]
    Parse(#[from] serde_json::Error),
}
