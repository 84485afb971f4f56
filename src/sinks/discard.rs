// SPDX-License-Identifier: Apache-2.0

use futures::future::BoxFuture;
use tracing::trace;

use super::{Sink, SinkError};
use crate::event::LogEvent;

/// Acknowledges every batch without sending it anywhere.
#[derive(Debug, Default)]
pub struct DiscardSink {
    discarded: u64,
}

impl DiscardSink {
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Sink for DiscardSink {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn deliver<'a>(&'a mut self, events: &'a [LogEvent]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            self.discarded += events.len() as u64;
            trace!(count = events.len(), "discarding events");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AssembledRecord;
    use crate::input::FileId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_discard_counts() {
        let record = AssembledRecord {
            file_id: FileId::new(1, 1),
            generation: 0,
            offset: 0,
            len: 4,
            content: b"abc".to_vec(),
            line_count: 1,
            truncated: false,
        };
        let event = LogEvent::from_record(record, Arc::from("/a"), Arc::from("h"));

        let mut sink = DiscardSink::default();
        sink.deliver(&[event.clone(), event]).await.unwrap();
        assert_eq!(sink.discarded(), 2);
    }
}
