// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PipelineError;
use super::retry::{Backoff, RetryConfig};
use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::event::{DeliveryState, LogEvent};
use crate::input::FileId;
use crate::offsets::{FileAck, LineOffset};
use crate::sinks::{Sink, SinkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub batch_size: usize,
    /// Longest wait for a batch to fill once its first event arrived.
    pub flush_interval: Duration,
    /// Bound on a single sink call.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 2048,
            flush_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Drains the event queue into the sink.
pub struct DeliveryWorker {
    rx: BoundedReceiver<LogEvent>,
    sink: Box<dyn Sink>,
    ack_tx: BoundedSender<FileAck>,
    config: DeliveryConfig,
    started: Option<oneshot::Sender<()>>,
}

enum Delivery {
    Delivered,
    Cancelled,
}

impl DeliveryWorker {
    pub fn new(
        rx: BoundedReceiver<LogEvent>,
        sink: Box<dyn Sink>,
        ack_tx: BoundedSender<FileAck>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            rx,
            sink,
            ack_tx,
            config,
            started: None,
        }
    }

    /// Notified once the worker is consuming the queue.
    pub fn with_started(mut self, started: oneshot::Sender<()>) -> Self {
        self.started = Some(started);
        self
    }

    /// Deliver until every publisher is gone and the queue is empty, or until
    /// `cancel_token` fires. Cancellation abandons the batch in hand; its
    /// offsets stay uncommitted so the events are read again on restart.
    pub async fn run(mut self, cancel_token: CancellationToken) -> Result<(), PipelineError> {
        info!(sink = self.sink.name(), "Delivery worker started");
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }

        let mut delivered = 0u64;
        let result = loop {
            let Some(mut batch) = self.next_batch(&cancel_token).await else {
                break Ok(());
            };

            match self.deliver(&mut batch, &cancel_token).await {
                Ok(Delivery::Delivered) => {
                    delivered += batch.len() as u64;
                    self.acknowledge(&batch).await;
                }
                Ok(Delivery::Cancelled) => {
                    warn!(
                        abandoned = batch.len(),
                        "Delivery cancelled with a batch in flight"
                    );
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.sink.close().await {
            warn!(sink = self.sink.name(), error = %e, "Failed to close sink");
        }
        info!(delivered, "Delivery worker stopped");
        result
    }

    /// Wait for the first event, then fill the batch until it is full, the
    /// flush interval elapses or the queue closes. None when there is
    /// nothing left to deliver.
    async fn next_batch(&mut self, cancel_token: &CancellationToken) -> Option<Vec<LogEvent>> {
        let first = select! {
            biased;

            _ = cancel_token.cancelled() => return None,
            ev = self.rx.next() => ev?,
        };

        let mut batch = Vec::with_capacity(self.config.batch_size.min(1024));
        batch.push(first);

        let deadline = Instant::now() + self.config.flush_interval;
        while batch.len() < self.config.batch_size {
            if let Some(ev) = self.rx.try_recv() {
                batch.push(ev);
                continue;
            }

            select! {
                biased;

                _ = cancel_token.cancelled() => return None,
                res = timeout_at(deadline, self.rx.next()) => match res {
                    Ok(Some(ev)) => batch.push(ev),
                    // closed or flush interval reached, ship what we have
                    Ok(None) | Err(_) => break,
                },
            }
        }

        Some(batch)
    }

    async fn deliver(
        &mut self,
        batch: &mut [LogEvent],
        cancel_token: &CancellationToken,
    ) -> Result<Delivery, PipelineError> {
        let mut backoff = Backoff::new(self.config.retry.clone());

        loop {
            let res = select! {
                biased;

                _ = cancel_token.cancelled() => return Ok(Delivery::Cancelled),
                res = timeout(self.config.timeout, self.sink.deliver(batch)) => res,
            };

            let err = match res {
                Ok(Ok(())) => {
                    for event in batch.iter_mut() {
                        event.state = DeliveryState::Sent;
                    }
                    debug!(count = batch.len(), "Delivered batch");
                    return Ok(Delivery::Delivered);
                }
                Ok(Err(e)) => e,
                Err(_) => SinkError::Timeout(self.config.timeout),
            };

            let Some(delay) = backoff.next_delay() else {
                for event in batch.iter_mut() {
                    event.state = DeliveryState::Failed;
                }
                error!(
                    sink = self.sink.name(),
                    attempts = backoff.attempts() + 1,
                    error = %err,
                    "Delivery failed past retry ceiling"
                );
                return Err(PipelineError::DeliveryFailed {
                    sink: self.sink.name(),
                    attempts: backoff.attempts() + 1,
                    source: err,
                });
            };

            info!(
                attempt = backoff.attempts(),
                delay = ?delay,
                error = %err,
                "Delivery failed, will retry again after delay."
            );

            select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel_token.cancelled() => return Ok(Delivery::Cancelled),
            }
        }
    }

    /// Report delivered offsets to the committer, one ack per file and
    /// generation, in queue order.
    async fn acknowledge(&mut self, batch: &[LogEvent]) {
        let mut acks: Vec<FileAck> = Vec::new();
        for event in batch {
            let key: (FileId, u64) = (event.source.file_id, event.source.generation);
            let offset: LineOffset = event.line_offset();
            match acks
                .iter_mut()
                .find(|a| (a.file_id, a.generation) == key)
            {
                Some(ack) => ack.offsets.push(offset),
                None => acks.push(FileAck {
                    file_id: key.0,
                    generation: key.1,
                    offsets: vec![offset],
                }),
            }
        }

        for ack in acks {
            if self.ack_tx.send(ack).await.is_err() {
                warn!("Offset committer is gone, delivered offsets will not be committed");
                return;
            }
        }
    }
}
