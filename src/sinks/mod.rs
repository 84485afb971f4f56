// SPDX-License-Identifier: Apache-2.0

//! Event sinks.
//!
//! A sink receives batches from the delivery worker. Returning `Ok` is the
//! acknowledgement: every event of the batch is considered delivered and its
//! offset may be committed. Errors are retried by the worker.

mod discard;
mod file;
mod stdout;

pub use discard::DiscardSink;
pub use file::FileSink;
pub use stdout::StdoutSink;

use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

use crate::event::LogEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub trait Sink: Send {
    fn name(&self) -> &'static str;

    fn deliver<'a>(&'a mut self, events: &'a [LogEvent]) -> BoxFuture<'a, Result<(), SinkError>>;

    /// Flush and release resources, called once after the last batch.
    fn close(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    File,
    Discard,
}

/// Build the sink selected by `output.type`.
pub fn build_sink(kind: SinkKind, path: Option<&PathBuf>) -> Result<Box<dyn Sink>, SinkError> {
    match kind {
        SinkKind::Stdout => Ok(Box::new(StdoutSink::new())),
        SinkKind::Discard => Ok(Box::new(DiscardSink::default())),
        SinkKind::File => match path {
            Some(path) => Ok(Box::new(FileSink::new(path.clone()))),
            None => Err(SinkError::Unavailable(
                "file output requires output.path".to_string(),
            )),
        },
    }
}

/// Encode a batch as newline-delimited JSON.
pub(crate) fn encode_json_lines(events: &[LogEvent]) -> Result<Vec<u8>, SinkError> {
    let mut buf = Vec::with_capacity(events.len() * 256);
    for event in events {
        serde_json::to_writer(&mut buf, event)?;
        buf.push(b'\n');
    }
    Ok(buf)
}
