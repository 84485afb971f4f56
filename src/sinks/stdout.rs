// SPDX-License-Identifier: Apache-2.0

use futures::future::BoxFuture;
use tokio::io::{AsyncWriteExt, Stdout};

use super::{Sink, SinkError, encode_json_lines};
use crate::event::LogEvent;

/// Writes events to stdout as JSON lines.
pub struct StdoutSink {
    out: Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn deliver<'a>(&'a mut self, events: &'a [LogEvent]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let buf = encode_json_lines(events)?;
            self.out.write_all(&buf).await?;
            self.out.flush().await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            self.out.flush().await?;
            Ok(())
        })
    }
}
