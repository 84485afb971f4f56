// SPDX-License-Identifier: Apache-2.0

//! File discovery.
//!
//! The glob scan is the source of truth: it runs every `scan_frequency` and
//! compares the file identities it finds with the ones it already knows. The
//! native watcher only shortens the wait until the next scan when a watched
//! directory changes.

mod native;

pub use native::{NativeWatcher, create_notifier};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::input::{FileFinder, FileId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications when available, otherwise scan-only.
    #[default]
    Auto,
    /// Native notifications are required.
    Native,
    /// Scan-only. Use on network file systems.
    #[serde(alias = "polling")]
    Poll,
}

/// Where to start reading a file that has no registry entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    #[default]
    Beginning,
    /// End of file, for files present at startup. Files created later are
    /// always read from the beginning.
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new file identity matched, read it from `offset`.
    Added {
        file_id: FileId,
        path: PathBuf,
        offset: u64,
    },
    /// A known file now matches under another path.
    Renamed { file_id: FileId, path: PathBuf },
    /// A known file is no longer found at any matching path.
    Rotated { file_id: FileId, path: PathBuf },
}

pub struct FileWatcher {
    finder: FileFinder,
    known: HashMap<FileId, PathBuf>,
    resume_offsets: HashMap<FileId, u64>,
    start_at: StartPosition,
    scans: u64,
}

impl FileWatcher {
    pub fn new(
        finder: FileFinder,
        resume_offsets: HashMap<FileId, u64>,
        start_at: StartPosition,
    ) -> Self {
        Self {
            finder,
            known: HashMap::new(),
            resume_offsets,
            start_at,
            scans: 0,
        }
    }

    pub fn finder(&self) -> &FileFinder {
        &self.finder
    }

    pub fn tracked(&self) -> usize {
        self.known.len()
    }

    /// Stop tracking a file so the next scan reports it as added again,
    /// resuming from `resume_offset` when given.
    pub fn forget(&mut self, file_id: FileId, resume_offset: Option<u64>) {
        self.known.remove(&file_id);
        if let Some(offset) = resume_offset {
            self.resume_offsets.insert(file_id, offset);
        }
    }

    pub fn scan(&mut self) -> Vec<WatchEvent> {
        let first_scan = self.scans == 0;
        self.scans += 1;

        let mut found: HashMap<FileId, PathBuf> = HashMap::new();
        for path in self.finder.find_files() {
            match FileId::from_path(&path) {
                // hard links: first path wins
                Ok(file_id) => {
                    found.entry(file_id).or_insert(path);
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Unable to stat file, will retry on next scan");
                }
            }
        }

        let mut events = Vec::new();

        let gone: Vec<FileId> = self
            .known
            .keys()
            .filter(|id| !found.contains_key(id))
            .copied()
            .collect();
        for file_id in gone {
            if let Some(path) = self.known.remove(&file_id) {
                info!(path = ?path, file_id = %file_id, "File rotated or removed");
                events.push(WatchEvent::Rotated { file_id, path });
            }
        }

        for (file_id, path) in found {
            match self.known.get_mut(&file_id) {
                Some(known_path) if *known_path == path => {}
                Some(known_path) => {
                    info!(from = ?known_path, to = ?path, "File renamed");
                    *known_path = path.clone();
                    events.push(WatchEvent::Renamed { file_id, path });
                }
                None => {
                    let offset = self.start_offset(file_id, &path, first_scan);
                    debug!(path = ?path, file_id = %file_id, offset, "New file");
                    self.known.insert(file_id, path.clone());
                    events.push(WatchEvent::Added {
                        file_id,
                        path,
                        offset,
                    });
                }
            }
        }

        events
    }

    fn start_offset(&mut self, file_id: FileId, path: &Path, first_scan: bool) -> u64 {
        if let Some(offset) = self.resume_offsets.remove(&file_id) {
            return offset;
        }
        if first_scan && self.start_at == StartPosition::End {
            match std::fs::metadata(path) {
                Ok(md) => return md.len(),
                Err(e) => warn!(path = ?path, error = %e, "Unable to stat file, reading from the beginning"),
            }
        }
        0
    }
}
