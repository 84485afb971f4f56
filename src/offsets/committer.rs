// SPDX-License-Identifier: Apache-2.0

//! Applies delivery acknowledgements to the offset tracker and checkpoints
//! the registry.
//!
//! Runs as its own task so it keeps receiving acknowledgements after intake
//! stops; the final checkpoint is written once the delivery worker is done.

use std::time::{Duration, Instant};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::input::FileId;
use crate::offsets::persistence::{
    JsonFilePersister, KNOWN_FILES_KEY, PersistedStateV1, RegistryError,
};
use crate::offsets::tracker::{LineOffset, SharedOffsetTracker, lock_tracker};

/// Delivered events of one file, sent by the delivery worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAck {
    pub file_id: FileId,
    pub generation: u64,
    pub offsets: Vec<LineOffset>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitterConfig {
    pub checkpoint_interval: Duration,
    /// Bound on waiting for late acknowledgements once cancelled.
    pub drain_timeout: Duration,
    /// Consecutive checkpoint failures are tolerated for this long.
    pub max_checkpoint_failure_duration: Duration,
    /// Offsets of files nobody reads are dropped after this long.
    pub inactive_retention: Duration,
}

impl Default for OffsetCommitterConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(2),
            max_checkpoint_failure_duration: Duration::from_secs(60),
            inactive_retention: Duration::from_secs(72 * 3600),
        }
    }
}

pub struct FileOffsetCommitter {
    ack_receiver: BoundedReceiver<FileAck>,
    offset_tracker: SharedOffsetTracker,
    persister: JsonFilePersister,
    config: OffsetCommitterConfig,
    checkpoint_first_failure: Option<Instant>,
}

impl FileOffsetCommitter {
    pub fn new(
        ack_receiver: BoundedReceiver<FileAck>,
        offset_tracker: SharedOffsetTracker,
        persister: JsonFilePersister,
        config: OffsetCommitterConfig,
    ) -> Self {
        Self {
            ack_receiver,
            offset_tracker,
            persister,
            config,
            checkpoint_first_failure: None,
        }
    }

    /// Process acknowledgements and checkpoint periodically until the ack
    /// channel closes or `cancel_token` fires, then write a final checkpoint.
    ///
    /// Returns an error if checkpoints keep failing past the configured
    /// duration, or if the final checkpoint fails.
    pub async fn run(mut self, cancel_token: CancellationToken) -> Result<(), RegistryError> {
        info!("Offset committer started");

        // no checkpoint before the first period has passed
        let period = self.config.checkpoint_interval;
        let mut checkpoint_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        checkpoint_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                ack = self.ack_receiver.next() => {
                    match ack {
                        Some(ack) => self.process_ack(ack),
                        None => {
                            debug!("Ack channel closed, finishing offset committer");
                            break;
                        }
                    }
                }

                _ = checkpoint_interval.tick() => {
                    if let Err(e) = self.maybe_checkpoint() {
                        error!(error = %e, "Checkpoint failures persisted beyond threshold, exiting");
                        return Err(e);
                    }
                }

                _ = cancel_token.cancelled() => {
                    debug!("Offset committer cancelled, draining pending acknowledgements");
                    self.drain().await;
                    break;
                }
            }
        }

        self.checkpoint().inspect_err(|e| {
            error!(error = %e, "Failed to write final checkpoint");
        })?;
        info!("Final checkpoint written");
        Ok(())
    }

    fn process_ack(&self, ack: FileAck) {
        debug!(
            file_id = %ack.file_id,
            offsets = ack.offsets.len(),
            "Processing file ack"
        );
        lock_tracker(&self.offset_tracker).acknowledge_batch(
            ack.file_id,
            ack.generation,
            &ack.offsets,
        );
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut ack_count = 0usize;

        loop {
            match tokio::time::timeout_at(deadline, self.ack_receiver.next()).await {
                Ok(Some(ack)) => {
                    self.process_ack(ack);
                    ack_count += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        processed = ack_count,
                        "Drain deadline reached with acknowledgements outstanding"
                    );
                    break;
                }
            }
        }

        if ack_count > 0 {
            info!("Drained {} pending acknowledgements", ack_count);
        }
    }

    /// Checkpoint, tolerating failures until they have lasted
    /// `max_checkpoint_failure_duration`.
    fn maybe_checkpoint(&mut self) -> Result<(), RegistryError> {
        match self.checkpoint() {
            Ok(()) => {
                if self.checkpoint_first_failure.take().is_some() {
                    info!("Checkpoint succeeded after previous failures");
                }
                Ok(())
            }
            Err(e) => {
                let first_failure = *self
                    .checkpoint_first_failure
                    .get_or_insert_with(Instant::now);
                let failure_duration = first_failure.elapsed();

                if failure_duration >= self.config.max_checkpoint_failure_duration {
                    Err(e)
                } else {
                    warn!(
                        error = %e,
                        failing_for = ?failure_duration,
                        "Checkpoint failed, will retry"
                    );
                    Ok(())
                }
            }
        }
    }

    fn checkpoint(&mut self) -> Result<(), RegistryError> {
        let snapshot = lock_tracker(&self.offset_tracker).snapshot();
        let state = PersistedStateV1::from_snapshot(&snapshot);

        self.persister.set_raw_json(KNOWN_FILES_KEY, &state)?;
        self.persister.sync()?;

        // closed files made it into this checkpoint, keep only their offset
        let mut tracker = lock_tracker(&self.offset_tracker);
        let pruned = tracker.prune_closed();
        let expired = tracker.expire_retained(self.config.inactive_retention);
        debug!(
            files = state.files.len(),
            pruned,
            expired,
            "Checkpoint completed"
        );
        Ok(())
    }
}
