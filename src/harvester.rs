// SPDX-License-Identifier: Apache-2.0

//! Per-file task: tails one file, reassembles records and publishes events.

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{AssembledRecord, AssemblerLimits, LineAssembler, RecordStart};
use crate::bounded_channel::BoundedReceiver;
use crate::event::LogEvent;
use crate::input::{FileId, ReadBatch, ReaderOptions, TailReader};
use crate::offsets::{SharedOffsetTracker, lock_tracker};
use crate::pipeline::{EventPublisher, PipelineError};

#[derive(Clone)]
pub struct HarvesterConfig {
    pub reader: ReaderOptions,
    pub limits: AssemblerLimits,
    pub record_start: Arc<dyn RecordStart>,
    /// Wait between reads once the file is at end of file.
    pub read_interval: Duration,
    /// Emit a pending multi-line record after this long without new lines.
    pub multiline_timeout: Duration,
    /// How long a rotated file must stay idle at EOF before it is closed.
    /// Writers may append to the old handle until they reopen their log.
    pub rotate_wait: Duration,
    pub host: Arc<str>,
}

/// Messages from the scan loop to a running harvester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvesterControl {
    Renamed(PathBuf),
    /// No longer reachable through the glob; drain to EOF and finish.
    Rotated,
    /// Matched by the glob again before the rotated file was closed.
    Reappeared(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Active,
    /// Rotated away, still draining.
    Rotated,
    /// Rotated and at EOF, closed once idle for `rotate_wait`.
    RotatedEof { eof_time: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// Rotated away and fully drained.
    Finished,
    /// Intake stopped.
    Stopped,
}

pub struct Harvester {
    reader: Option<TailReader>,
    file_id: FileId,
    path: Arc<str>,
    assembler: LineAssembler,
    publisher: EventPublisher,
    tracker: SharedOffsetTracker,
    control: BoundedReceiver<HarvesterControl>,
    config: HarvesterConfig,
    last_line_at: Instant,
    assembled: Vec<AssembledRecord>,
}

impl Harvester {
    pub fn new(
        reader: TailReader,
        publisher: EventPublisher,
        tracker: SharedOffsetTracker,
        control: BoundedReceiver<HarvesterControl>,
        config: HarvesterConfig,
    ) -> Self {
        let path: Arc<str> = Arc::from(reader.path().to_string_lossy().as_ref());
        Self {
            file_id: reader.file_id(),
            reader: Some(reader),
            path,
            assembler: LineAssembler::new(config.record_start.clone(), config.limits),
            publisher,
            tracker,
            control,
            config,
            last_line_at: Instant::now(),
            assembled: Vec::new(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Tail the file until it is rotated away and drained, or until `intake`
    /// fires. Events still held by the assembler at shutdown are published
    /// under `pipeline`, which stays alive while the queue drains.
    pub async fn run(
        mut self,
        intake: CancellationToken,
        pipeline: CancellationToken,
    ) -> Result<HarvestOutcome, Box<dyn Error + Send + Sync>> {
        debug!(path = %self.path, file_id = %self.file_id, "Harvester started");

        let mut read_interval = tokio::time::interval(self.config.read_interval);
        read_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rotation = Rotation::Active;
        let mut more = true;

        loop {
            if intake.is_cancelled() {
                break;
            }

            if !more {
                select! {
                    biased;

                    _ = intake.cancelled() => break,
                    ctl = self.control.next() => match ctl {
                        Some(HarvesterControl::Renamed(path)) => self.rename(path),
                        Some(HarvesterControl::Rotated) => {
                            if rotation == Rotation::Active {
                                debug!(path = %self.path, "Draining rotated file");
                                rotation = Rotation::Rotated;
                            }
                        }
                        Some(HarvesterControl::Reappeared(path)) => {
                            debug!(path = ?path, "Rotated file is back, tailing again");
                            rotation = Rotation::Active;
                            self.rename(path);
                        }
                        // scan loop is gone
                        None => break,
                    },
                    _ = read_interval.tick() => {},
                }
            }

            let batch = match self.read().await {
                Ok(batch) => batch,
                Err(e) if rotation != Rotation::Active => {
                    warn!(path = %self.path, error = %e, "Read failed while draining rotated file");
                    return self.finish_rotated(&pipeline).await;
                }
                Err(e) if self.reader.is_none() => return Err(e.into()),
                Err(e) => {
                    warn!(path = %self.path, error = %e, "Read failed, will retry");
                    more = false;
                    continue;
                }
            };
            more = !batch.eof;
            let had_records = !batch.records.is_empty();

            if let Err(e) = self.process(batch, &intake).await {
                return Self::stopped_by(e);
            }

            rotation = match rotation {
                Rotation::Active => Rotation::Active,
                _ if more => Rotation::Rotated,
                Rotation::Rotated => Rotation::RotatedEof {
                    eof_time: Instant::now(),
                },
                // late writes through the old handle restart the wait
                Rotation::RotatedEof { .. } if had_records => Rotation::RotatedEof {
                    eof_time: Instant::now(),
                },
                Rotation::RotatedEof { eof_time } => {
                    if eof_time.elapsed() >= self.config.rotate_wait {
                        return self.finish_rotated(&pipeline).await;
                    }
                    Rotation::RotatedEof { eof_time }
                }
            };

            if !more
                && self.assembler.has_pending()
                && self.last_line_at.elapsed() >= self.config.multiline_timeout
            {
                debug!(path = %self.path, "Multiline timeout, flushing pending record");
                if let Err(e) = self.flush(&intake).await {
                    return Self::stopped_by(e);
                }
            }
        }

        // partial lines stay unread so the next run starts at their beginning
        if let Err(e) = self.flush(&pipeline).await {
            warn!(path = %self.path, error = %e, "Unable to publish pending record at shutdown");
        }
        debug!(path = %self.path, "Harvester stopped");
        Ok(HarvestOutcome::Stopped)
    }

    fn stopped_by(e: PipelineError) -> Result<HarvestOutcome, Box<dyn Error + Send + Sync>> {
        match e {
            PipelineError::Cancelled => Ok(HarvestOutcome::Stopped),
            e => Err(e.into()),
        }
    }

    fn rename(&mut self, path: PathBuf) {
        let path_str: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
        debug!(from = %self.path, to = %path_str, "Harvester following rename");
        lock_tracker(&self.tracker).update_path(self.file_id, path_str.clone());
        if let Some(reader) = self.reader.as_mut() {
            reader.set_path(path);
        }
        self.path = path_str;
    }

    async fn read(&mut self) -> io::Result<ReadBatch> {
        let Some(mut reader) = self.reader.take() else {
            return Err(io::Error::other("reader lost after a failed read"));
        };
        let (reader, res) = tokio::task::spawn_blocking(move || {
            let res = reader.read();
            (reader, res)
        })
        .await
        .map_err(io::Error::other)?;
        self.reader = Some(reader);
        res
    }

    async fn process(
        &mut self,
        batch: ReadBatch,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if batch.discontinuity {
            // the pending record belongs to the old contents
            self.flush(cancel).await?;
            let generation = self.reader.as_ref().map(|r| r.generation()).unwrap_or(0);
            lock_tracker(&self.tracker).reset(self.file_id, generation);
        }

        if batch.records.is_empty() {
            return Ok(());
        }
        self.last_line_at = Instant::now();

        let mut out = std::mem::take(&mut self.assembled);
        for line in batch.records {
            self.assembler.push(line, &mut out);
        }
        let res = self.publish_all(&mut out, cancel).await;
        self.assembled = out;
        res
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        match self.assembler.flush() {
            Some(record) => self.publish(record, cancel).await,
            None => Ok(()),
        }
    }

    async fn publish_all(
        &mut self,
        records: &mut Vec<AssembledRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for record in records.drain(..) {
            self.publish(record, cancel).await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        record: AssembledRecord,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let event = LogEvent::from_record(record, self.path.clone(), self.config.host.clone());
        self.publisher.publish(event, cancel).await
    }

    /// The rotated file is complete: its last line may lack a newline.
    async fn finish_rotated(
        mut self,
        pipeline: &CancellationToken,
    ) -> Result<HarvestOutcome, Box<dyn Error + Send + Sync>> {
        let partial = self.reader.as_mut().and_then(|r| r.take_partial());
        let mut out = Vec::new();
        if let Some(line) = partial {
            self.assembler.push(line, &mut out);
        }
        if let Some(record) = self.assembler.flush() {
            out.push(record);
        }
        if let Err(e) = self.publish_all(&mut out, pipeline).await {
            return Self::stopped_by(e);
        }

        lock_tracker(&self.tracker).close(self.file_id);
        let offset = self.reader.as_ref().map(|r| r.offset()).unwrap_or(0);
        info!(path = %self.path, offset, "Finished rotated file");
        Ok(HarvestOutcome::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::PatternStart;
    use crate::bounded_channel::{BoundedSender, bounded};
    use crate::offsets::FileOffsetTracker;
    use crate::pipeline::QueueConfig;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        tracker: SharedOffsetTracker,
        events: BoundedReceiver<LogEvent>,
        control: BoundedSender<HarvesterControl>,
        harvester: Harvester,
    }

    fn config() -> HarvesterConfig {
        HarvesterConfig {
            reader: ReaderOptions::default(),
            limits: AssemblerLimits::default(),
            record_start: Arc::new(PatternStart::weblogic().unwrap()),
            read_interval: Duration::from_millis(10),
            multiline_timeout: Duration::from_millis(50),
            rotate_wait: Duration::from_millis(100),
            host: Arc::from("wls01"),
        }
    }

    fn fixture(contents: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("AdminServer.log");
        fs::write(&path, contents).unwrap();

        let reader = TailReader::open(&path, 0, ReaderOptions::default()).unwrap();
        let tracker = FileOffsetTracker::new().shared();
        lock_tracker(&tracker).register(
            reader.file_id(),
            Arc::from(path.to_string_lossy().as_ref()),
            0,
        );
        let (publisher, events) = EventPublisher::new(&QueueConfig::default(), tracker.clone());
        let (control, control_rx) = bounded(4);
        let harvester = Harvester::new(reader, publisher, tracker.clone(), control_rx, config());

        Fixture {
            _dir: dir,
            path,
            tracker,
            events,
            control,
            harvester,
        }
    }

    async fn next_message(events: &mut BoundedReceiver<LogEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .message
    }

    #[tokio::test]
    async fn test_multiline_record_flushed_on_idle() {
        let mut f = fixture(
            "####<Oct 1> <Info> <one>\n####<Oct 1> <Error> <two>\njava.lang.Exception\n\tat Foo.bar\n",
        );
        let intake = CancellationToken::new();
        let handle = tokio::spawn(f.harvester.run(intake.clone(), CancellationToken::new()));

        assert_eq!(next_message(&mut f.events).await, "####<Oct 1> <Info> <one>");
        assert_eq!(
            next_message(&mut f.events).await,
            "####<Oct 1> <Error> <two>\njava.lang.Exception\n\tat Foo.bar"
        );

        intake.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), HarvestOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_follows_appends() {
        let mut f = fixture("####<a>\n");
        let intake = CancellationToken::new();
        let handle = tokio::spawn(f.harvester.run(intake.clone(), CancellationToken::new()));

        let mut file = OpenOptions::new().append(true).open(&f.path).unwrap();
        file.write_all(b"####<b>\n####<c>\n").unwrap();

        assert_eq!(next_message(&mut f.events).await, "####<a>");
        assert_eq!(next_message(&mut f.events).await, "####<b>");

        intake.cancel();
        handle.await.unwrap().unwrap();
        // flushed on shutdown
        assert_eq!(next_message(&mut f.events).await, "####<c>");
    }

    #[tokio::test]
    async fn test_truncation_resets_tracker() {
        let mut f = fixture("####<first entry that is long>\n####<x>\n");
        let intake = CancellationToken::new();
        let file_id = f.harvester.file_id();
        let handle = tokio::spawn(f.harvester.run(intake.clone(), CancellationToken::new()));

        assert_eq!(next_message(&mut f.events).await, "####<first entry that is long>");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(next_message(&mut f.events).await, "####<x>");

        fs::write(&f.path, "####<new>\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let ev = tokio::time::timeout(Duration::from_secs(5), f.events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.message, "####<new>");
        assert_eq!(ev.source.generation, 1);
        assert_eq!(ev.source.offset, 0);

        intake.cancel();
        handle.await.unwrap().unwrap();

        // only the new generation's event is pending
        let t = lock_tracker(&f.tracker);
        assert_eq!(t.pending_count(file_id), 1);
        assert_eq!(t.get_persistable_offset(file_id), Some(0));
    }

    #[tokio::test]
    async fn test_rotation_drains_and_closes() {
        let mut f = fixture("####<a>\n####<b> no newline");
        let file_id = f.harvester.file_id();
        let handle = tokio::spawn(
            f.harvester
                .run(CancellationToken::new(), CancellationToken::new()),
        );

        assert_eq!(next_message(&mut f.events).await, "####<a>");
        let rotated = f.path.with_extension("log.1");
        fs::rename(&f.path, &rotated).unwrap();
        f.control.send(HarvesterControl::Rotated).await.unwrap();

        assert_eq!(next_message(&mut f.events).await, "####<b> no newline");
        assert_eq!(handle.await.unwrap().unwrap(), HarvestOutcome::Finished);

        let mut t = lock_tracker(&f.tracker);
        assert_eq!(t.pending_count(file_id), 2);
        // closed, pruned once both events are acknowledged
        assert_eq!(t.prune_closed(), 0);
    }

    #[tokio::test]
    async fn test_rotated_file_reads_late_writes() {
        let mut f = fixture("####<one>\n");
        let mut writer = OpenOptions::new().append(true).open(&f.path).unwrap();
        f.harvester.config.rotate_wait = Duration::from_millis(500);
        let handle = tokio::spawn(
            f.harvester
                .run(CancellationToken::new(), CancellationToken::new()),
        );

        assert_eq!(next_message(&mut f.events).await, "####<one>");
        fs::rename(&f.path, f.path.with_extension("log.1")).unwrap();
        f.control.send(HarvesterControl::Rotated).await.unwrap();

        // the server still holds the old handle
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.write_all(b"####<two>\n").unwrap();

        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            let mut messages = Vec::new();
            while let Some(ev) = f.events.next().await {
                messages.push(ev.message);
            }
            messages
        })
        .await
        .unwrap();
        assert_eq!(rest, vec!["####<two>"]);
        assert_eq!(handle.await.unwrap().unwrap(), HarvestOutcome::Finished);
    }

    #[tokio::test]
    async fn test_reappeared_file_keeps_tailing() {
        let mut f = fixture("####<one>\n");
        f.harvester.config.rotate_wait = Duration::from_secs(60);
        let intake = CancellationToken::new();
        let file_id = f.harvester.file_id();
        let handle = tokio::spawn(f.harvester.run(intake.clone(), CancellationToken::new()));

        assert_eq!(next_message(&mut f.events).await, "####<one>");
        let moved = f.path.with_extension("tmp");
        fs::rename(&f.path, &moved).unwrap();
        f.control.send(HarvesterControl::Rotated).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fs::rename(&moved, &f.path).unwrap();
        f.control
            .send(HarvesterControl::Reappeared(f.path.clone()))
            .await
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&f.path).unwrap();
        file.write_all(b"####<two>\n").unwrap();

        // nothing is read twice
        assert_eq!(next_message(&mut f.events).await, "####<two>");
        intake.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), HarvestOutcome::Stopped);
        assert!(f.events.next().await.is_none());
        assert!(lock_tracker(&f.tracker).is_tracked(file_id));
    }

    #[tokio::test]
    async fn test_rename_updates_path() {
        let mut f = fixture("####<a>\n");
        let intake = CancellationToken::new();
        let file_id = f.harvester.file_id();
        let handle = tokio::spawn(f.harvester.run(intake.clone(), CancellationToken::new()));

        assert_eq!(next_message(&mut f.events).await, "####<a>");

        let renamed = f.path.with_file_name("AdminServer-1.log");
        fs::rename(&f.path, &renamed).unwrap();
        f.control
            .send(HarvesterControl::Renamed(renamed.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut file = OpenOptions::new().append(true).open(&renamed).unwrap();
        file.write_all(b"####<b>\n####<c>\n").unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(5), f.events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.message, "####<b>");
        assert_eq!(&*ev.source.path, renamed.to_string_lossy().as_ref());

        intake.cancel();
        handle.await.unwrap().unwrap();
        let snapshot = lock_tracker(&f.tracker).snapshot();
        assert_eq!(snapshot[0].file_id, file_id);
        assert_eq!(&*snapshot[0].path, renamed.to_string_lossy().as_ref());
    }
}
