// SPDX-License-Identifier: Apache-2.0

//! Versioned layout of the registry file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::input::FileId;
use crate::offsets::tracker::PersistableFile;

/// Key under which file offsets are stored in the registry scope.
pub const KNOWN_FILES_KEY: &str = "knownFiles";

pub const PERSISTED_STATE_VERSION: u8 = 1;

/// Offsets of all known files, keyed by "dev:ino".
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStateV1 {
    pub version: u8,
    pub files: HashMap<String, PersistedFileEntryV1>,
}

impl Default for PersistedStateV1 {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            files: HashMap::new(),
        }
    }
}

impl PersistedStateV1 {
    pub fn from_snapshot(snapshot: &[PersistableFile]) -> Self {
        let files = snapshot
            .iter()
            .map(|f| {
                let entry = PersistedFileEntryV1::new(f.file_id, &f.path, f.offset);
                (entry.key(), entry)
            })
            .collect();

        Self {
            version: PERSISTED_STATE_VERSION,
            files,
        }
    }

    /// Entries in the shape the tracker keeps them.
    pub fn files(&self) -> Vec<PersistableFile> {
        let mut files: Vec<PersistableFile> = self
            .files
            .values()
            .map(|e| PersistableFile {
                file_id: e.file_id(),
                path: Arc::from(e.path.as_str()),
                offset: e.offset,
            })
            .collect();
        files.sort_by_key(|f| f.file_id);
        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFileEntryV1 {
    // last known location, informational only
    pub path: String,
    pub filename: String,

    pub dev: u64,
    pub ino: u64,

    pub offset: u64,
}

impl PersistedFileEntryV1 {
    pub fn new(file_id: FileId, path: &str, offset: u64) -> Self {
        let filename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            path: path.to_string(),
            filename,
            dev: file_id.dev(),
            ino: file_id.ino(),
            offset,
        }
    }

    pub fn file_id(&self) -> FileId {
        FileId::new(self.dev, self.ino)
    }

    pub fn key(&self) -> String {
        self.file_id().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_path() {
        let entry = PersistedFileEntryV1::new(FileId::new(1, 100), "/u01/logs/ms1.log", 500);
        assert_eq!(entry.filename, "ms1.log");
        assert_eq!(entry.key(), "1:100");
    }

    #[test]
    fn test_state_from_snapshot() {
        let snapshot = vec![
            PersistableFile {
                file_id: FileId::new(1, 100),
                path: Arc::from("/u01/logs/a.log"),
                offset: 10,
            },
            PersistableFile {
                file_id: FileId::new(1, 200),
                path: Arc::from("/u01/logs/b.log"),
                offset: 0,
            },
        ];

        let state = PersistedStateV1::from_snapshot(&snapshot);
        assert_eq!(state.version, PERSISTED_STATE_VERSION);
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.files["1:100"].offset, 10);

        assert_eq!(state.files(), snapshot);
    }

    #[test]
    fn test_v1_layout() {
        let json = r#"{"version":1,"files":{"3:4":{"path":"/l/s.log","filename":"s.log","dev":3,"ino":4,"offset":77}}}"#;
        let state: PersistedStateV1 = serde_json::from_str(json).unwrap();
        let files = state.files();
        assert_eq!(files[0].file_id, FileId::new(3, 4));
        assert_eq!(files[0].offset, 77);
        assert_eq!(&*files[0].path, "/l/s.log");
    }
}
