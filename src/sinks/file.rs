// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use futures::future::BoxFuture;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Sink, SinkError, encode_json_lines};
use crate::event::LogEvent;

/// Appends events to a file as JSON lines. The file is opened on the first
/// batch, so a missing directory surfaces as a retryable delivery error.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    async fn file(&mut self) -> Result<&mut File, SinkError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!(path = %self.path.display(), "Opened output file");
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| SinkError::Unavailable("output file not open".to_string()))
    }
}

impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn deliver<'a>(&'a mut self, events: &'a [LogEvent]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let buf = encode_json_lines(events)?;
            let res = async {
                let file = self.file().await?;
                file.write_all(&buf).await?;
                file.flush().await?;
                Ok::<(), SinkError>(())
            }
            .await;

            if res.is_err() {
                // reopen on the next attempt
                self.file = None;
            }
            res
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if let Some(file) = self.file.take() {
                file.sync_all().await?;
            }
            Ok(())
        })
    }
}
