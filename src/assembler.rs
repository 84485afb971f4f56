// SPDX-License-Identifier: Apache-2.0

//! Reassembles lines into log records.
//!
//! WebLogic writes one entry per `####<...>` header, but stack traces and
//! wrapped messages continue on following lines. Which lines begin a record
//! is decided by a [`RecordStart`] rule so other log layouts can plug in
//! their own.
//!
//! A pending record is emitted when the next record start arrives, when it
//! would grow past the size or line limits, or when the owner calls
//! [`LineAssembler::flush`] (idle timeout, rotation drain, shutdown).
//!
//! Blank lines inside a record are kept. A blank line that belongs to no
//! record would become an empty event and is skipped instead.

use std::sync::Arc;

use regex::bytes::Regex;
use tracing::debug;

use crate::input::{FileId, RawRecord};

/// Header that opens every entry in a WebLogic server or domain log.
pub const WEBLOGIC_RECORD_START: &str = "^####<";

/// Decides whether a line opens a new record.
pub trait RecordStart: Send + Sync {
    fn is_start(&self, line: &[u8]) -> bool;

    /// Records are single lines, so they can be emitted without waiting for
    /// the next start.
    fn single_line(&self) -> bool {
        false
    }
}

/// Every line is its own record.
#[derive(Debug, Default, Clone, Copy)]
pub struct EveryLine;

impl RecordStart for EveryLine {
    fn is_start(&self, _line: &[u8]) -> bool {
        true
    }

    fn single_line(&self) -> bool {
        true
    }
}

/// Lines matching `pattern` start a record. With `negate`, matching lines are
/// continuations and everything else starts a record.
#[derive(Debug, Clone)]
pub struct PatternStart {
    pattern: Regex,
    negate: bool,
}

impl PatternStart {
    pub fn new(pattern: &str, negate: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            negate,
        })
    }

    pub fn weblogic() -> Result<Self, regex::Error> {
        Self::new(WEBLOGIC_RECORD_START, false)
    }
}

impl RecordStart for PatternStart {
    fn is_start(&self, line: &[u8]) -> bool {
        self.pattern.is_match(line) != self.negate
    }
}

/// A finished record with the byte range it covers in its source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledRecord {
    pub file_id: FileId,
    pub generation: u64,
    pub offset: u64,
    pub len: u64,
    pub content: Vec<u8>,
    pub line_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerLimits {
    /// Largest record kept in memory; the excess is cut.
    pub max_bytes: usize,
    /// Most lines joined into one record.
    pub max_lines: usize,
}

impl Default for AssemblerLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_lines: 500,
        }
    }
}

#[derive(Debug)]
struct Pending {
    file_id: FileId,
    generation: u64,
    offset: u64,
    end: u64,
    content: Vec<u8>,
    line_count: usize,
    truncated: bool,
}

impl Pending {
    fn begin(line: RawRecord) -> Self {
        Self {
            file_id: line.file_id,
            generation: line.generation,
            offset: line.offset,
            end: line.end_offset(),
            truncated: line.truncated,
            content: line.bytes,
            line_count: 1,
        }
    }

    fn finish(self) -> AssembledRecord {
        AssembledRecord {
            file_id: self.file_id,
            generation: self.generation,
            offset: self.offset,
            len: self.end - self.offset,
            content: self.content,
            line_count: self.line_count,
            truncated: self.truncated,
        }
    }
}

pub struct LineAssembler {
    rule: Arc<dyn RecordStart>,
    limits: AssemblerLimits,
    pending: Option<Pending>,
    // continuation lines of a record that was already force-emitted
    skipping: bool,
    skipped_lines: u64,
}

impl LineAssembler {
    pub fn new(rule: Arc<dyn RecordStart>, limits: AssemblerLimits) -> Self {
        Self {
            rule,
            limits,
            pending: None,
            skipping: false,
            skipped_lines: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one line, appending any records it completes to `out`.
    pub fn push(&mut self, line: RawRecord, out: &mut Vec<AssembledRecord>) {
        if line.bytes.is_empty() && (self.rule.single_line() || self.pending.is_none()) {
            if self.skipping {
                self.skipped_lines += 1;
            } else {
                debug!(
                    file_id = %line.file_id,
                    offset = line.offset,
                    "Skipping blank line outside a record"
                );
            }
            return;
        }
        let is_start = !line.bytes.is_empty() && self.rule.is_start(&line.bytes);

        if is_start {
            self.end_skip();
            if let Some(done) = self.pending.take() {
                out.push(done.finish());
            }
            let mut pending = Pending::begin(line);
            if pending.content.len() > self.limits.max_bytes {
                pending.content.truncate(self.limits.max_bytes);
                pending.truncated = true;
            }
            if self.rule.single_line() || pending.truncated {
                out.push(pending.finish());
                self.skipping = !self.rule.single_line();
            } else {
                self.pending = Some(pending);
            }
            return;
        }

        if self.skipping {
            self.skipped_lines += 1;
            return;
        }

        let Some(pending) = self.pending.as_mut() else {
            // continuation with nothing to attach to, keep it as its own record
            self.pending = Some(Pending::begin(line));
            return;
        };

        let needed = pending.content.len() + 1 + line.bytes.len();
        let over_bytes = needed > self.limits.max_bytes;
        let over_lines = pending.line_count + 1 > self.limits.max_lines;

        if over_bytes || over_lines {
            if over_bytes && !over_lines && pending.content.len() < self.limits.max_bytes {
                let room = self.limits.max_bytes - pending.content.len() - 1;
                pending.content.push(b'\n');
                pending
                    .content
                    .extend_from_slice(&line.bytes[..room.min(line.bytes.len())]);
                pending.line_count += 1;
            }
            pending.end = line.end_offset();
            pending.truncated = true;

            debug!(
                file_id = %pending.file_id,
                offset = pending.offset,
                lines = pending.line_count,
                "Record exceeds limits, emitting truncated"
            );
            if let Some(done) = self.pending.take() {
                out.push(done.finish());
            }
            self.skipping = true;
            return;
        }

        pending.content.push(b'\n');
        pending.content.extend_from_slice(&line.bytes);
        pending.end = line.end_offset();
        pending.line_count += 1;
        pending.truncated |= line.truncated;
    }

    /// Emit whatever is buffered.
    pub fn flush(&mut self) -> Option<AssembledRecord> {
        self.end_skip();
        self.pending.take().map(Pending::finish)
    }

    fn end_skip(&mut self) {
        if self.skipping && self.skipped_lines > 0 {
            debug!(
                lines = self.skipped_lines,
                "Dropped continuation lines of truncated record"
            );
        }
        self.skipping = false;
        self.skipped_lines = 0;
    }
}
