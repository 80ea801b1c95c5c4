//! Shared collaborators handed to every module.
use std::{path::PathBuf, sync::Arc};

use crate::{
    config::Settings,
    console::Console,
    process::{Launcher, ProcessLauncher},
    store::VarStore,
};

/// Console, var store, launcher and settings, created once at start-up and
/// cloned into each [`Module`](crate::module::Module).
#[derive(Debug, Clone)]
pub struct Context {
    pub console: Console,
    pub store: VarStore,
    pub launcher: Arc<dyn Launcher>,
    pub settings: Settings,
    /// Root for the var store and service lock files.
    pub state_dir: PathBuf,
}

impl Context {
    /// Real processes, stdio console and the settings' state directory.
    pub fn from_settings(settings: Settings) -> Self {
        let state_dir = settings.state_dir();
        Self {
            console: Console::stdio(),
            store: VarStore::in_state_dir(&state_dir),
            launcher: Arc::new(ProcessLauncher::new(settings.interpreters())),
            settings,
            state_dir,
        }
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Moves the var store and lock files under `state_dir`.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self.store = VarStore::in_state_dir(&self.state_dir);
        self
    }

    /// Directory holding service lock files.
    pub fn services_dir(&self) -> PathBuf {
        self.state_dir.join("services")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::from_settings(Settings::default())
    }
}
