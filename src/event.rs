// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assembler::AssembledRecord;
use crate::input::FileId;
use crate::offsets::LineOffset;

/// Delivery progress of an event. Only the delivery worker moves it forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Pending,
    Sent,
    Failed,
}

/// Where an event was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSource {
    pub path: Arc<str>,
    pub file_id: FileId,
    pub generation: u64,
    pub offset: u64,
    pub len: u64,
}

/// A reassembled log record ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    #[serde(rename = "@timestamp")]
    pub ingested_at: DateTime<Utc>,
    pub message: String,
    pub host: Arc<str>,
    pub source: EventSource,
    pub line_count: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip)]
    pub state: DeliveryState,
}

impl LogEvent {
    pub fn from_record(record: AssembledRecord, path: Arc<str>, host: Arc<str>) -> Self {
        let message = match String::from_utf8(record.content) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };

        Self {
            ingested_at: Utc::now(),
            message,
            host,
            source: EventSource {
                path,
                file_id: record.file_id,
                generation: record.generation,
                offset: record.offset,
                len: record.len,
            },
            line_count: record.line_count,
            truncated: record.truncated,
            state: DeliveryState::Pending,
        }
    }

    pub fn line_offset(&self) -> LineOffset {
        LineOffset::new(self.source.offset, self.source.len)
    }
}

/// Hostname attached to every event.
pub fn local_hostname() -> Arc<str> {
    Arc::from(gethostname::gethostname().to_string_lossy().as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &[u8]) -> AssembledRecord {
        AssembledRecord {
            file_id: FileId::new(8, 9),
            generation: 2,
            offset: 100,
            len: 40,
            content: content.to_vec(),
            line_count: 2,
            truncated: false,
        }
    }

    #[test]
    fn test_event_metadata() {
        let ev = LogEvent::from_record(
            record(b"####<a>\nat x"),
            Arc::from("/u01/logs/AdminServer.log"),
            Arc::from("wls-host-1"),
        );

        assert_eq!(ev.message, "####<a>\nat x");
        assert_eq!(ev.state, DeliveryState::Pending);
        assert_eq!(ev.line_offset(), LineOffset::new(100, 40));
        assert_eq!(ev.source.generation, 2);
    }

    #[test]
    fn test_event_json_shape() {
        let ev = LogEvent::from_record(record(b"msg"), Arc::from("/l/s.log"), Arc::from("h"));
        let v = serde_json::to_value(&ev).unwrap();

        assert_eq!(v["message"], "msg");
        assert_eq!(v["host"], "h");
        assert_eq!(v["source"]["path"], "/l/s.log");
        assert_eq!(v["source"]["offset"], 100);
        assert_eq!(v["source"]["file_id"]["ino"], 9);
        assert!(v.get("@timestamp").is_some());
        assert!(v.get("truncated").is_none());
        assert!(v.get("state").is_none());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let ev = LogEvent::from_record(record(b"ok \xff end"), Arc::from("p"), Arc::from("h"));
        assert_eq!(ev.message, "ok \u{FFFD} end");
    }

    #[test]
    fn test_hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
