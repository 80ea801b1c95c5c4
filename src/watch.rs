//! File-change detection for module watch lists.
use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::{debug, info};

use crate::{
    error::ToolkitError,
    module::Module,
    store::{Var, VarStore},
};

/// Pause between two scans of a [`ChangeWatcher`].
pub const WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Modification time as persisted; `None` when the file did not exist.
type Mtime = Option<DateTime<Utc>>;

/// A file whose modification time was snapshotted when it was registered.
#[derive(Debug, Clone)]
pub struct WatchFile {
    module_root: PathBuf,
    path: PathBuf,
    baseline: Var<Mtime>,
}

impl WatchFile {
    /// Registers `path` for `module_root` and persists its current mtime.
    ///
    /// A leading `/` makes `path` relative to the module root; anything else
    /// is used as given.
    pub fn new(module_root: &Path, path: &str, store: &VarStore) -> Result<Self, ToolkitError> {
        let path = match path.strip_prefix('/') {
            Some(relative) => module_root.join(relative),
            None => PathBuf::from(path),
        };

        let baseline = store.var(format!("{}::__mtime__", path.display()));
        let mtime = live_mtime(&path);
        baseline.save(&mtime)?;
        debug!("Watching {} (mtime {:?})", path.display(), mtime);

        Ok(Self {
            module_root: module_root.to_path_buf(),
            path,
            baseline,
        })
    }

    /// True when the live mtime differs from the one recorded at registration.
    /// Never updates the record.
    pub fn modified(&self) -> bool {
        self.changed().is_some()
    }

    /// The live mtime when it differs from the recorded one.
    fn changed(&self) -> Option<Mtime> {
        let live = live_mtime(&self.path);
        match self.baseline.read() {
            Ok(Some(recorded)) if recorded == live => None,
            Ok(_) => Some(live),
            Err(err) => {
                debug!("Unreadable mtime record for {}: {err}", self.path.display());
                Some(live)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn module_root(&self) -> &Path {
        &self.module_root
    }
}

fn live_mtime(path: &Path) -> Mtime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Endless iterator over watch files as they change.
///
/// Each scan walks every file in registration order. A change is yielded once;
/// the file is yielded again only after its mtime moves a second time.
#[derive(Debug)]
pub struct ChangeWatcher {
    files: Vec<WatchFile>,
    reported: Vec<Option<Mtime>>,
    pending: VecDeque<WatchFile>,
    interval: Duration,
    scanned: bool,
}

impl ChangeWatcher {
    pub fn new(files: Vec<WatchFile>) -> Self {
        Self {
            reported: vec![None; files.len()],
            files,
            pending: VecDeque::new(),
            interval: WATCH_INTERVAL,
            scanned: false,
        }
    }

    /// Overrides the pause between scans.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn files(&self) -> &[WatchFile] {
        &self.files
    }

    fn scan(&mut self) {
        for (file, reported) in self.files.iter().zip(self.reported.iter_mut()) {
            match file.changed() {
                None => *reported = None,
                Some(live) if *reported == Some(live) => {}
                Some(live) => {
                    info!("Detected change in {}", file.path.display());
                    *reported = Some(live);
                    self.pending.push_back(file.clone());
                }
            }
        }
    }
}

impl Iterator for ChangeWatcher {
    type Item = WatchFile;

    fn next(&mut self) -> Option<WatchFile> {
        loop {
            if let Some(file) = self.pending.pop_front() {
                return Some(file);
            }
            if self.scanned {
                thread::sleep(self.interval);
            }
            self.scan();
            self.scanned = true;
        }
    }
}

/// Watches the union of the modules' watch files, in module order.
pub fn when_modified(modules: &[&Module]) -> ChangeWatcher {
    let files = modules
        .iter()
        .flat_map(|module| module.watch_files().iter().cloned())
        .collect();
    ChangeWatcher::new(files)
}
