// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use portable_atomic::{AtomicU64, Ordering};
use serde::Deserialize;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PipelineError;
use crate::bounded_channel::{self, BoundedReceiver, BoundedSender, TrySendError};
use crate::event::LogEvent;
use crate::offsets::{SharedOffsetTracker, lock_tracker};

/// What to do with a new event when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the publisher until there is room.
    #[default]
    Block,
    /// Evict the oldest queued event to make room.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub size: usize,
    #[serde(alias = "overflow_policy")]
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size: 4096,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Publishing side of the event queue, one clone per harvester.
#[derive(Clone)]
pub struct EventPublisher {
    tx: BoundedSender<LogEvent>,
    evict_rx: Option<BoundedReceiver<LogEvent>>,
    dropped: Arc<AtomicU64>,
    tracker: SharedOffsetTracker,
}

impl EventPublisher {
    /// Create the queue. Returns the publisher and the receiver for the
    /// delivery worker.
    pub fn new(
        config: &QueueConfig,
        tracker: SharedOffsetTracker,
    ) -> (Self, BoundedReceiver<LogEvent>) {
        let (tx, rx) = bounded_channel::bounded(config.size.max(1));
        let evict_rx = match config.overflow {
            OverflowPolicy::Block => None,
            OverflowPolicy::DropOldest => Some(rx.clone()),
        };

        let publisher = Self {
            tx,
            evict_rx,
            dropped: Arc::new(AtomicU64::new(0)),
            tracker,
        };
        (publisher, rx)
    }

    /// Events evicted under the drop-oldest policy since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Track the event's offset and queue it. Under the block policy this
    /// waits for room until `cancel` fires.
    pub async fn publish(
        &self,
        event: LogEvent,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        lock_tracker(&self.tracker).track(
            event.source.file_id,
            event.source.generation,
            event.line_offset(),
        );

        match &self.evict_rx {
            None => {
                select! {
                    res = self.tx.send(event) => res.map_err(|_| PipelineError::QueueClosed),
                    _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                }
            }
            Some(evict_rx) => self.publish_evicting(event, evict_rx),
        }
    }

    fn publish_evicting(
        &self,
        mut event: LogEvent,
        evict_rx: &BoundedReceiver<LogEvent>,
    ) -> Result<(), PipelineError> {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(PipelineError::QueueClosed),
                Err(TrySendError::Full(rejected)) => {
                    event = rejected;
                    // the worker may have taken it first, then there is room now
                    if let Some(oldest) = evict_rx.try_recv() {
                        self.drop_event(oldest);
                    }
                }
            }
        }
    }

    fn drop_event(&self, event: LogEvent) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;

        // a dropped event must not hold back the committed offset forever
        lock_tracker(&self.tracker).acknowledge(
            event.source.file_id,
            event.source.generation,
            event.line_offset(),
        );

        if total == 1 || total % 1000 == 0 {
            warn!(
                dropped_total = total,
                path = %event.source.path,
                offset = event.source.offset,
                "Event queue full, dropped oldest event"
            );
        } else {
            debug!(
                dropped_total = total,
                offset = event.source.offset,
                "Event queue full, dropped oldest event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AssembledRecord;
    use crate::input::FileId;
    use crate::offsets::FileOffsetTracker;
    use std::time::Duration;

    fn id() -> FileId {
        FileId::new(7, 70)
    }

    fn event(offset: u64) -> LogEvent {
        let record = AssembledRecord {
            file_id: id(),
            generation: 0,
            offset,
            len: 10,
            content: format!("line at {}", offset).into_bytes(),
            line_count: 1,
            truncated: false,
        };
        LogEvent::from_record(record, Arc::from("/u01/logs/ms1.log"), Arc::from("wls01"))
    }

    fn tracker() -> SharedOffsetTracker {
        let tracker = FileOffsetTracker::new().shared();
        lock_tracker(&tracker).register(id(), Arc::from("/u01/logs/ms1.log"), 0);
        tracker
    }

    #[tokio::test]
    async fn test_publish_tracks_offset() {
        let tracker = tracker();
        let (publisher, mut rx) = EventPublisher::new(&QueueConfig::default(), tracker.clone());

        publisher
            .publish(event(0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(lock_tracker(&tracker).pending_count(id()), 1);
        assert_eq!(rx.next().await.unwrap().source.offset, 0);
    }

    #[tokio::test]
    async fn test_block_policy_waits_and_never_drops() {
        let config = QueueConfig {
            size: 1,
            overflow: OverflowPolicy::Block,
        };
        let (publisher, mut rx) = EventPublisher::new(&config, tracker());
        let cancel = CancellationToken::new();

        publisher.publish(event(0), &cancel).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            publisher.publish(event(10), &cancel),
        )
        .await;
        assert!(blocked.is_err());

        let p = publisher.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move { p.publish(event(20), &c).await });
        assert_eq!(rx.next().await.unwrap().source.offset, 0);
        handle.await.unwrap().unwrap();
        assert_eq!(rx.next().await.unwrap().source.offset, 20);
        assert_eq!(publisher.dropped(), 0);
    }

    #[tokio::test]
    async fn test_block_policy_cancel() {
        let config = QueueConfig {
            size: 1,
            overflow: OverflowPolicy::Block,
        };
        let (publisher, _rx) = EventPublisher::new(&config, tracker());
        let cancel = CancellationToken::new();

        publisher.publish(event(0), &cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            publisher.publish(event(10), &cancel).await,
            Err(PipelineError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_and_acks() {
        let tracker = tracker();
        let config = QueueConfig {
            size: 2,
            overflow: OverflowPolicy::DropOldest,
        };
        let (publisher, mut rx) = EventPublisher::new(&config, tracker.clone());
        let cancel = CancellationToken::new();

        for off in [0, 10, 20, 30] {
            publisher.publish(event(off), &cancel).await.unwrap();
        }

        assert_eq!(publisher.dropped(), 2);
        assert_eq!(rx.next().await.unwrap().source.offset, 20);
        assert_eq!(rx.next().await.unwrap().source.offset, 30);

        // the two evicted events no longer hold the offset back
        let t = lock_tracker(&tracker);
        assert_eq!(t.pending_count(id()), 2);
        assert_eq!(t.get_persistable_offset(id()), Some(20));
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (publisher, rx) = EventPublisher::new(&QueueConfig::default(), tracker());
        drop(rx);
        assert!(matches!(
            publisher.publish(event(0), &CancellationToken::new()).await,
            Err(PipelineError::QueueClosed)
        ));
    }
}
