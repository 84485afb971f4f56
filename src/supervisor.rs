// SPDX-License-Identifier: Apache-2.0

//! Scan loop: turns watcher events into running harvesters.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::task::{Id, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{self, BoundedSender, TrySendError};
use crate::harvester::{HarvestOutcome, Harvester, HarvesterConfig, HarvesterControl};
use crate::input::{FileId, TailReader};
use crate::offsets::{SharedOffsetTracker, lock_tracker};
use crate::pipeline::EventPublisher;
use crate::watcher::{FileWatcher, WatchEvent, WatchMode, create_notifier};

type HarvestResult = (FileId, Result<HarvestOutcome, Box<dyn Error + Send + Sync>>);

const CONTROL_CHANNEL_SIZE: usize = 8;

pub struct Supervisor {
    watcher: FileWatcher,
    harvester_config: HarvesterConfig,
    publisher: EventPublisher,
    tracker: SharedOffsetTracker,
    scan_frequency: Duration,
    watch_mode: WatchMode,
    first_scan: Option<oneshot::Sender<usize>>,
    harvesters: JoinSet<HarvestResult>,
    running: HashMap<FileId, BoundedSender<HarvesterControl>>,
    task_ids: HashMap<Id, FileId>,
}

impl Supervisor {
    pub fn new(
        watcher: FileWatcher,
        harvester_config: HarvesterConfig,
        publisher: EventPublisher,
        tracker: SharedOffsetTracker,
        scan_frequency: Duration,
        watch_mode: WatchMode,
    ) -> Self {
        Self {
            watcher,
            harvester_config,
            publisher,
            tracker,
            scan_frequency,
            watch_mode,
            first_scan: None,
            harvesters: JoinSet::new(),
            running: HashMap::new(),
            task_ids: HashMap::new(),
        }
    }

    /// Receives the number of tracked files once the first scan has started
    /// its harvesters.
    pub fn with_first_scan(mut self, tx: oneshot::Sender<usize>) -> Self {
        self.first_scan = Some(tx);
        self
    }

    /// Scan until `intake` fires, then wait for every harvester to stop. The
    /// publisher is dropped on return, which closes the queue once the last
    /// harvester is gone.
    pub async fn run(
        mut self,
        intake: CancellationToken,
        pipeline: CancellationToken,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (hint_tx, mut hint_rx) = bounded_channel::bounded::<()>(1);
        let roots = self.watcher.finder().watch_roots();
        let notifier = create_notifier(self.watch_mode, &roots, hint_tx)?;
        let has_notifier = notifier.is_some();

        let mut scan_interval = tokio::time::interval(self.scan_frequency);
        scan_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick is immediate
        scan_interval.tick().await;

        info!(
            roots = ?roots,
            scan_frequency = %humantime::format_duration(self.scan_frequency),
            "Watching for log files"
        );

        let mut scan_due = true;
        loop {
            if scan_due {
                self.scan(&intake, &pipeline);
                if let Some(tx) = self.first_scan.take() {
                    let _ = tx.send(self.watcher.tracked());
                }
            }

            scan_due = select! {
                biased;

                _ = intake.cancelled() => break,

                Some(res) = self.harvesters.join_next_with_id(), if !self.harvesters.is_empty() => {
                    self.reap(res);
                    false
                },

                _ = scan_interval.tick() => true,

                Some(_) = hint_rx.next(), if has_notifier => {
                    debug!("File system change, scanning early");
                    true
                },
            };
        }

        drop(notifier);
        debug!(harvesters = self.harvesters.len(), "Waiting for harvesters to stop");
        while let Some(res) = self.harvesters.join_next_with_id().await {
            self.reap(res);
        }
        info!("File watcher stopped");
        Ok(())
    }

    fn scan(&mut self, intake: &CancellationToken, pipeline: &CancellationToken) {
        for event in self.watcher.scan() {
            match event {
                WatchEvent::Added {
                    file_id,
                    path,
                    offset,
                } => self.start_harvester(file_id, path, offset, intake, pipeline),
                WatchEvent::Renamed { file_id, path } => {
                    self.control(file_id, HarvesterControl::Renamed(path))
                }
                WatchEvent::Rotated { file_id, .. } => {
                    self.control(file_id, HarvesterControl::Rotated)
                }
            }
        }
    }

    fn start_harvester(
        &mut self,
        file_id: FileId,
        path: PathBuf,
        offset: u64,
        intake: &CancellationToken,
        pipeline: &CancellationToken,
    ) {
        if let Some(tx) = self.running.get(&file_id) {
            // moved away and back while its harvester was draining it
            debug!(path = ?path, file_id = %file_id, "File reappeared, resuming its harvester");
            if tx.try_send(HarvesterControl::Reappeared(path)).is_err() {
                // the harvester is already finishing, start over once reaped
                self.watcher.forget(file_id, None);
            }
            return;
        }
        // a file seen before resumes where its last harvester stopped
        let offset = lock_tracker(&self.tracker)
            .resume_offset(file_id)
            .unwrap_or(offset);

        let reader = match TailReader::open(&path, offset, self.harvester_config.reader) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = ?path, error = %e, "Unable to open file, will retry on next scan");
                self.watcher.forget(file_id, Some(offset));
                return;
            }
        };
        if reader.file_id() != file_id {
            debug!(path = ?path, "File replaced between scan and open, will retry on next scan");
            self.watcher.forget(file_id, Some(offset));
            return;
        }

        lock_tracker(&self.tracker).register(
            file_id,
            Arc::from(path.to_string_lossy().as_ref()),
            offset,
        );

        let (control_tx, control_rx) = bounded_channel::bounded(CONTROL_CHANNEL_SIZE);
        let harvester = Harvester::new(
            reader,
            self.publisher.clone(),
            self.tracker.clone(),
            control_rx,
            self.harvester_config.clone(),
        );

        let intake = intake.clone();
        let pipeline = pipeline.clone();
        let handle = self
            .harvesters
            .spawn(async move { (file_id, harvester.run(intake, pipeline).await) });

        info!(path = ?path, file_id = %file_id, offset, "Harvester started");
        self.task_ids.insert(handle.id(), file_id);
        self.running.insert(file_id, control_tx);
    }

    fn control(&mut self, file_id: FileId, msg: HarvesterControl) {
        let Some(tx) = self.running.get(&file_id) else {
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(file_id = %file_id, msg = ?msg, "Harvester control channel full, dropping message")
            }
            // already finished, reaped on the next loop
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn reap(&mut self, res: Result<(Id, HarvestResult), tokio::task::JoinError>) {
        let (file_id, outcome) = match res {
            Ok((id, (file_id, outcome))) => {
                self.task_ids.remove(&id);
                (file_id, outcome)
            }
            Err(e) => {
                let Some(file_id) = self.task_ids.remove(&e.id()) else {
                    error!(error = %e, "Harvester task failed");
                    return;
                };
                (file_id, Err(e.into()))
            }
        };
        self.running.remove(&file_id);

        match outcome {
            Ok(HarvestOutcome::Finished) | Ok(HarvestOutcome::Stopped) => {}
            Err(e) => {
                // keep its place so the next scan picks it up again
                let offset = lock_tracker(&self.tracker).get_persistable_offset(file_id);
                warn!(file_id = %file_id, error = %e, "Harvester failed, will restart on next scan");
                self.watcher.forget(file_id, offset);
            }
        }
    }
}
