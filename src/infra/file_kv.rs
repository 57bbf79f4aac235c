//! Directory-backed [`PersistentKv`]: one file per key.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::cache::{PersistenceError, PersistentKv};

use super::error::InfraError;

const FILE_EXTENSION: &str = "json";

/// Stores each key in `<directory>/<hex(key)>.json`. Writes go through a
/// temporary file in the same directory and are renamed into place, so a
/// reader never sees a half-written value.
#[derive(Debug, Clone)]
pub struct FileKv {
    directory: PathBuf,
}

impl FileKv {
    /// Open (and create if needed) the store rooted at `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, InfraError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|err| InfraError::storage(&directory, err))?;
        debug!(directory = %directory.display(), "Opened file key/value store");
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Keys currently stored, sorted. Files not written by this store are skipped.
    pub fn keys(&self) -> Result<Vec<String>, InfraError> {
        let mut keys = Vec::new();
        let storage_error = |err: std::io::Error| InfraError::storage(&self.directory, err);
        for entry in fs::read_dir(&self.directory).map_err(storage_error)? {
            let path = entry.map_err(storage_error)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(raw) = hex::decode(stem)
                && let Ok(key) = String::from_utf8(raw)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{FILE_EXTENSION}", hex::encode(key)))
    }
}

impl PersistentKv for FileKv {
    fn load(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
        match fs::read(self.path_for(key)) {
            Ok(contents) => Ok(Some(Bytes::from(contents))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PersistenceError::read_failed(key, err)),
        }
    }

    fn store(&self, key: &str, value: Bytes) -> Result<(), PersistenceError> {
        let mut file = tempfile::Builder::new()
            .prefix(".kv-")
            .suffix(".tmp")
            .tempfile_in(&self.directory)
            .map_err(|err| PersistenceError::write_failed(key, err))?;
        file.write_all(&value)
            .and_then(|()| file.as_file().sync_all())
            .map_err(|err| PersistenceError::write_failed(key, err))?;
        file.persist(self.path_for(key))
            .map_err(|err| PersistenceError::write_failed(key, err.error))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistenceError::write_failed(key, err)),
        }
    }
}
