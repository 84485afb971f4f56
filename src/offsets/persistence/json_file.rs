// SPDX-License-Identifier: Apache-2.0

//! JSON file registry with atomic writes.
//!
//! The file holds one map per scope. Writes go to a temporary sibling first
//! and are renamed over the registry, so a crash mid-write leaves the previous
//! checkpoint intact.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::RegistryError;

type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseState {
    scopes: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// Shared handle to the registry file.
#[derive(Clone)]
pub struct JsonFileDatabase {
    path: PathBuf,
    state: Arc<RwLock<DatabaseState>>,
}

impl JsonFileDatabase {
    /// Open the registry at `path`, creating parent directories as needed.
    /// An unreadable or malformed file is an error rather than a fresh start,
    /// since silently discarding offsets would re-ship every log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = File::open(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_reader(BufReader::new(file)).map_err(|source| {
                RegistryError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
            DatabaseState::default()
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// In-memory registry, nothing touches disk.
    pub fn open_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(RwLock::new(DatabaseState::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persister(&self, scope: impl Into<String>) -> JsonFilePersister {
        JsonFilePersister {
            path: self.path.clone(),
            state: self.state.clone(),
            scope: scope.into(),
            cache: HashMap::new(),
        }
    }
}

/// View of a single scope of the registry.
pub struct JsonFilePersister {
    path: PathBuf,
    state: Arc<RwLock<DatabaseState>>,
    scope: String,
    cache: HashMap<String, serde_json::Value>,
}

impl JsonFilePersister {
    pub fn set_raw_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json_value = serde_json::to_value(value).map_err(RegistryError::Encode)?;
        self.cache.insert(key.to_string(), json_value);
        Ok(())
    }

    /// Ok(None) when the key is absent, Err when it exists but does not match
    /// the expected shape.
    pub fn try_get_raw_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.cache.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|source| RegistryError::Corrupt {
                    path: self.path.clone(),
                    source,
                }),
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.cache.remove(key);
    }

    /// Load the scope from the shared state into the cache.
    pub fn load(&mut self) -> Result<()> {
        let state = self.state.read().map_err(|_| RegistryError::Lock)?;

        self.cache.clear();
        if let Some(scope_data) = state.scopes.get(&self.scope) {
            self.cache
                .extend(scope_data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(())
    }

    /// Publish the cache to the shared state and write it to disk.
    pub fn sync(&self) -> Result<()> {
        {
            let mut state = self.state.write().map_err(|_| RegistryError::Lock)?;
            let scope_data = state.scopes.entry(self.scope.clone()).or_default();
            scope_data.clear();
            scope_data.extend(self.cache.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let state = self.state.read().map_err(|_| RegistryError::Lock)?;
        atomic_write(&self.path, &state)
    }
}

fn atomic_write(path: &Path, state: &DatabaseState) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let io_err = |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    // pid + counter keeps concurrent writers off each other's temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state).map_err(RegistryError::Encode)?;
    writer.flush().map_err(io_err)?;
    writer
        .into_inner()
        .map_err(|e| io_err(e.into_error()))?
        .sync_all()
        .map_err(io_err)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(e));
    }

    Ok(())
}
