// SPDX-License-Identifier: Apache-2.0

//! In-flight offset tracking for at-least-once delivery.
//!
//! Every event handed to the queue is tracked by the byte range it covers.
//! The offset that may be persisted for a file is the lowest range still in
//! flight, or the end of the furthest acknowledged range when nothing is in
//! flight. Resuming from it can replay events but never skips one.
//!
//! Each file carries a truncation generation. Acknowledgements of events read
//! before the most recent truncation refer to bytes that no longer exist and
//! are ignored.
//!
//! Files nobody is reading (restored from the registry but not opened yet,
//! or closed and fully acknowledged) keep their last offset as a retained
//! entry, so they are still checkpointed and resume where they left off if
//! the same identity shows up again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::input::FileId;

/// Byte range `[offset, offset + len)` of an event in its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOffset {
    pub offset: u64,
    pub len: u64,
}

impl LineOffset {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.len
    }
}

/// Offset and metadata of one file as it should be written to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistableFile {
    pub file_id: FileId,
    pub path: Arc<str>,
    pub offset: u64,
}

#[derive(Debug)]
struct FileOffsets {
    path: Arc<str>,
    generation: u64,
    // begin offset -> len
    pending: BTreeMap<u64, u64>,
    high_water_mark: LineOffset,
    closed: bool,
}

impl FileOffsets {
    fn persistable_offset(&self) -> u64 {
        match self.pending.first_key_value() {
            Some((begin, _)) => *begin,
            None => self.high_water_mark.end_offset(),
        }
    }

    /// End of the last event read, acknowledged or not.
    fn read_offset(&self) -> u64 {
        let pending_end = self
            .pending
            .last_key_value()
            .map(|(begin, len)| begin + len)
            .unwrap_or(0);
        pending_end.max(self.high_water_mark.end_offset())
    }
}

#[derive(Debug)]
struct Retained {
    path: Arc<str>,
    offset: u64,
    since: Instant,
}

#[derive(Debug, Default)]
pub struct FileOffsetTracker {
    files: HashMap<FileId, FileOffsets>,
    retained: HashMap<FileId, Retained>,
}

pub type SharedOffsetTracker = Arc<Mutex<FileOffsetTracker>>;

/// Lock the shared tracker. The tracker holds no invariants a panicking
/// holder could break half-way, so a poisoned lock is still usable.
pub fn lock_tracker(tracker: &SharedOffsetTracker) -> MutexGuard<'_, FileOffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileOffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedOffsetTracker {
        Arc::new(Mutex::new(self))
    }

    /// Keep the offset of a file known from the registry until it is
    /// registered again or expires.
    pub fn restore(&mut self, file_id: FileId, path: Arc<str>, offset: u64) {
        if self.files.contains_key(&file_id) {
            return;
        }
        self.retained.insert(
            file_id,
            Retained {
                path,
                offset,
                since: Instant::now(),
            },
        );
    }

    /// Where reading should resume for a file nobody is reading.
    pub fn resume_offset(&self, file_id: FileId) -> Option<u64> {
        match self.files.get(&file_id) {
            Some(file) if file.closed => Some(file.read_offset()),
            Some(_) => None,
            None => self.retained.get(&file_id).map(|r| r.offset),
        }
    }

    /// Start tracking a file that is read from `start_offset`.
    ///
    /// A closed entry of the same file keeps the events it still has in
    /// flight so their acknowledgements are not lost.
    pub fn register(&mut self, file_id: FileId, path: Arc<str>, start_offset: u64) {
        self.retained.remove(&file_id);

        let pending = match self.files.remove(&file_id) {
            Some(old) if old.generation == 0 => old.pending,
            _ => BTreeMap::new(),
        };
        self.files.insert(
            file_id,
            FileOffsets {
                path,
                generation: 0,
                pending,
                high_water_mark: LineOffset::new(start_offset, 0),
                closed: false,
            },
        );
    }

    pub fn update_path(&mut self, file_id: FileId, path: Arc<str>) {
        if let Some(file) = self.files.get_mut(&file_id) {
            file.path = path;
        }
    }

    /// The file was truncated and is now read from 0 under `generation`.
    pub fn reset(&mut self, file_id: FileId, generation: u64) {
        if let Some(file) = self.files.get_mut(&file_id) {
            if generation <= file.generation {
                return;
            }
            debug!(
                file_id = %file_id,
                generation,
                dropped = file.pending.len(),
                "Resetting offsets after truncation"
            );
            file.generation = generation;
            file.pending.clear();
            file.high_water_mark = LineOffset::new(0, 0);
        }
    }

    /// Record an event as in flight. Call before it is queued.
    pub fn track(&mut self, file_id: FileId, generation: u64, line_offset: LineOffset) {
        let current = self.files.get(&file_id).map(|f| f.generation);
        if current.is_some_and(|g| generation > g) {
            self.reset(file_id, generation);
        }
        let Some(file) = self.files.get_mut(&file_id) else {
            debug!(file_id = %file_id, "Tracking offset of unregistered file");
            return;
        };
        if generation < file.generation {
            return;
        }
        file.pending.insert(line_offset.offset, line_offset.len);
    }

    /// Record an event as delivered (or deliberately dropped).
    pub fn acknowledge(&mut self, file_id: FileId, generation: u64, line_offset: LineOffset) {
        let Some(file) = self.files.get_mut(&file_id) else {
            return;
        };
        if generation != file.generation {
            debug!(
                file_id = %file_id,
                generation,
                current = file.generation,
                "Ignoring acknowledgement from previous generation"
            );
            return;
        }

        file.pending.remove(&line_offset.offset);
        if line_offset.end_offset() > file.high_water_mark.end_offset() {
            file.high_water_mark = line_offset;
        }
    }

    pub fn acknowledge_batch(&mut self, file_id: FileId, generation: u64, offsets: &[LineOffset]) {
        for line_offset in offsets {
            self.acknowledge(file_id, generation, *line_offset);
        }
    }

    /// The harvester is done with this file; it moves to the retained set
    /// once nothing read from it is in flight.
    pub fn close(&mut self, file_id: FileId) {
        if let Some(file) = self.files.get_mut(&file_id) {
            file.closed = true;
        }
    }

    /// Offset to resume from for one file.
    pub fn get_persistable_offset(&self, file_id: FileId) -> Option<u64> {
        self.files
            .get(&file_id)
            .map(FileOffsets::persistable_offset)
            .or_else(|| self.retained.get(&file_id).map(|r| r.offset))
    }

    /// Every file worth a registry entry, tracked or retained.
    pub fn snapshot(&self) -> Vec<PersistableFile> {
        let tracked = self.files.iter().map(|(file_id, file)| PersistableFile {
            file_id: *file_id,
            path: file.path.clone(),
            offset: file.persistable_offset(),
        });
        let retained = self.retained.iter().map(|(file_id, r)| PersistableFile {
            file_id: *file_id,
            path: r.path.clone(),
            offset: r.offset,
        });
        let mut files: Vec<PersistableFile> = tracked.chain(retained).collect();
        files.sort_by_key(|f| f.file_id);
        files
    }

    /// Move closed files without anything in flight to the retained set.
    /// Returns how many were moved.
    pub fn prune_closed(&mut self) -> usize {
        let done: Vec<FileId> = self
            .files
            .iter()
            .filter(|(_, file)| file.closed && file.pending.is_empty())
            .map(|(file_id, _)| *file_id)
            .collect();
        for file_id in &done {
            if let Some(file) = self.files.remove(file_id) {
                self.retained.insert(
                    *file_id,
                    Retained {
                        offset: file.persistable_offset(),
                        path: file.path,
                        since: Instant::now(),
                    },
                );
            }
        }
        done.len()
    }

    /// Drop retained entries nobody has read for `max_age`. Returns how many
    /// were dropped.
    pub fn expire_retained(&mut self, max_age: Duration) -> usize {
        let before = self.retained.len();
        self.retained.retain(|_, r| r.since.elapsed() < max_age);
        before - self.retained.len()
    }

    pub fn is_retained(&self, file_id: FileId) -> bool {
        self.retained.contains_key(&file_id)
    }

    pub fn pending_count(&self, file_id: FileId) -> usize {
        self.files
            .get(&file_id)
            .map(|file| file.pending.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.files.values().map(|file| file.pending.len()).sum()
    }

    pub fn is_tracked(&self, file_id: FileId) -> bool {
        self.files.contains_key(&file_id)
    }
}
