// SPDX-License-Identifier: Apache-2.0

//! Durable offset store.

mod json_file;
mod schema;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::input::FileId;
use crate::offsets::tracker::PersistableFile;

pub use json_file::{JsonFileDatabase, JsonFilePersister};
pub use schema::{
    KNOWN_FILES_KEY, PERSISTED_STATE_VERSION, PersistedFileEntryV1, PersistedStateV1,
};

/// Scope of the registry used for file offsets.
pub const INPUT_SCOPE: &str = "log_input";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported registry version {0}")]
    UnsupportedVersion(u8),

    #[error("failed to encode registry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("registry lock poisoned")]
    Lock,
}

/// Read the files stored in the input scope.
pub fn load_files(persister: &mut JsonFilePersister) -> Result<Vec<PersistableFile>, RegistryError> {
    persister.load()?;
    match persister.try_get_raw_json::<PersistedStateV1>(KNOWN_FILES_KEY)? {
        None => Ok(Vec::new()),
        Some(state) if state.version != PERSISTED_STATE_VERSION => {
            Err(RegistryError::UnsupportedVersion(state.version))
        }
        Some(state) => Ok(state.files()),
    }
}

/// Read the resume offsets stored in the input scope.
pub fn load_offsets(persister: &mut JsonFilePersister) -> Result<HashMap<FileId, u64>, RegistryError> {
    Ok(load_files(persister)?
        .into_iter()
        .map(|f| (f.file_id, f.offset))
        .collect())
}
