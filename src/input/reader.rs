// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::file_id::FileId;

/// One complete line read from a tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub file_id: FileId,
    /// Truncation generation of the file when this line was read.
    pub generation: u64,
    /// Byte position where the line begins.
    pub offset: u64,
    /// Bytes consumed, including the line terminator.
    pub len: u64,
    /// Line content without the terminator.
    pub bytes: Vec<u8>,
    /// The line was longer than the configured limit and was cut.
    pub truncated: bool,
}

impl RawRecord {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len
    }
}

/// Result of a single read pass.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub records: Vec<RawRecord>,
    /// The file shrank below the read position; the reader restarted at 0.
    pub discontinuity: bool,
    /// Everything up to the current end of file has been consumed.
    pub eof: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Longest line kept; anything past it is dropped until the newline.
    pub max_line_bytes: usize,
    /// Size of each read() call.
    pub read_buffer_bytes: usize,
    /// Upper bound of bytes consumed by one read pass, so a large backlog is
    /// fed downstream in pieces.
    pub max_read_bytes: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
            read_buffer_bytes: 64 * 1024,
            max_read_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Tails a single file through one open handle.
///
/// `offset` is the start of the first line not yet handed out. Bytes between
/// `offset` and `read_pos` belong to an unterminated line and are buffered
/// (up to `max_line_bytes`) until its newline shows up.
pub struct TailReader {
    path: PathBuf,
    file: File,
    file_id: FileId,
    offset: u64,
    read_pos: u64,
    generation: u64,
    last_size: u64,
    partial: Vec<u8>,
    overflowed: bool,
    chunk: Vec<u8>,
    options: ReaderOptions,
}

impl TailReader {
    /// Open `path` and position the reader at `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64, options: ReaderOptions) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_id = FileId::from_file(&file)?;
        let last_size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            file_id,
            offset,
            read_pos: offset,
            generation: 0,
            last_size,
            partial: Vec::new(),
            overflowed: false,
            chunk: vec![0; options.read_buffer_bytes.max(1)],
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Update the path after the file was renamed under another matching name.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    pub fn has_partial(&self) -> bool {
        self.read_pos > self.offset
    }

    /// Read everything appended since the last pass, up to `max_read_bytes`.
    pub fn read(&mut self) -> io::Result<ReadBatch> {
        let mut batch = ReadBatch::default();

        let size = self.file.metadata()?.len();
        if size < self.read_pos {
            warn!(
                path = ?self.path,
                file_id = %self.file_id,
                size,
                offset = self.read_pos,
                "File truncated, restarting from the beginning"
            );
            self.restart();
            batch.discontinuity = true;
        }
        self.last_size = size;

        if self.read_pos >= size {
            batch.eof = true;
            return Ok(batch);
        }

        self.file.seek(SeekFrom::Start(self.read_pos))?;

        let mut consumed = 0u64;
        loop {
            if consumed >= self.options.max_read_bytes {
                break;
            }
            let n = match self.file.read(&mut self.chunk) {
                Ok(0) => {
                    batch.eof = true;
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            consumed += n as u64;

            let chunk = std::mem::take(&mut self.chunk);
            self.consume(&chunk[..n], &mut batch.records);
            self.chunk = chunk;
        }

        Ok(batch)
    }

    /// Hand out a trailing unterminated line. Only used once the file is known
    /// to be complete (rotated away or removed).
    pub fn take_partial(&mut self) -> Option<RawRecord> {
        if !self.has_partial() {
            return None;
        }
        Some(self.complete_line())
    }

    fn restart(&mut self) {
        self.offset = 0;
        self.read_pos = 0;
        self.partial.clear();
        self.overflowed = false;
        self.generation += 1;
    }

    fn consume(&mut self, mut data: &[u8], out: &mut Vec<RawRecord>) {
        while !data.is_empty() {
            match data.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    self.append_partial(&data[..idx]);
                    self.read_pos += idx as u64 + 1;
                    out.push(self.complete_line());
                    data = &data[idx + 1..];
                }
                None => {
                    self.append_partial(data);
                    self.read_pos += data.len() as u64;
                    break;
                }
            }
        }
    }

    fn append_partial(&mut self, bytes: &[u8]) {
        let room = self.options.max_line_bytes.saturating_sub(self.partial.len());
        if bytes.len() > room {
            if !self.overflowed {
                warn!(
                    path = ?self.path,
                    offset = self.offset,
                    max_line_bytes = self.options.max_line_bytes,
                    "Line exceeds maximum size, truncating"
                );
            }
            self.partial.extend_from_slice(&bytes[..room]);
            self.overflowed = true;
        } else {
            self.partial.extend_from_slice(bytes);
        }
    }

    fn complete_line(&mut self) -> RawRecord {
        let mut bytes = std::mem::take(&mut self.partial);
        if !self.overflowed && bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        let record = RawRecord {
            file_id: self.file_id,
            generation: self.generation,
            offset: self.offset,
            len: self.read_pos - self.offset,
            bytes,
            truncated: self.overflowed,
        };

        self.offset = self.read_pos;
        self.overflowed = false;
        record
    }
}
