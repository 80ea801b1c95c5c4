//! Small persistent key → value store.
//!
//! Every key lives in its own JSON file under the store directory, named by the
//! SHA-256 of the key, so unrelated keys never contend for the same file.
use fs2::FileExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use crate::error::StoreError;

/// Directory-backed collection of variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarStore {
    dir: PathBuf,
}

/// On-disk shape of one variable. The key is kept for humans inspecting the file.
#[derive(Serialize)]
struct RecordRef<'a, T> {
    key: &'a str,
    value: &'a T,
}

#[derive(Deserialize)]
struct Record<T> {
    value: T,
}

impl VarStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the `vars` folder of a state directory.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("vars"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Handle to the variable stored under `key`.
    pub fn var<T>(&self, key: impl Into<String>) -> Var<T> {
        let key = key.into();
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        Var {
            path: self.dir.join(format!("{digest}.json")),
            key,
            _marker: PhantomData,
        }
    }
}

/// A single typed variable in a [`VarStore`].
pub struct Var<T> {
    key: String,
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> Var<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the stored value.
    pub fn save(&self, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = RecordRef {
            key: self.key.as_str(),
            value,
        };
        let contents = serde_json::to_string_pretty(&record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file)?;
        file.set_len(0)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        FileExt::unlock(&file)?;
        Ok(())
    }

    /// Reads the stored value, `None` when it was never saved.
    pub fn read(&self) -> Result<Option<T>, StoreError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        FileExt::lock_shared(&file)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        FileExt::unlock(&file)?;

        let record: Record<T> = serde_json::from_str(&contents)?;
        Ok(Some(record.value))
    }

    /// Removes the variable. Missing variables are not an error.
    pub fn delete(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
