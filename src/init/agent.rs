// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel;
use crate::event::local_hostname;
use crate::init::config::AgentConfig;
use crate::init::wait::{self, BoxError, TaskSet, WaitError};
use crate::input::FileFinder;
use crate::offsets::persistence::{INPUT_SCOPE, load_files};
use crate::offsets::{FileOffsetCommitter, FileOffsetTracker, JsonFileDatabase};
use crate::pipeline::{DeliveryWorker, EventPublisher};
use crate::readiness::ReadinessSignal;
use crate::shutdown::{ShutdownCoordinator, ShutdownState};
use crate::sinks::{Sink, build_sink};
use crate::supervisor::Supervisor;
use crate::watcher::FileWatcher;

const ACK_CHANNEL_SIZE: usize = 1024;

/// Time given to tasks to notice cancellation once the drain is abandoned.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Bound on the final checkpoint.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Agent {
    config: AgentConfig,
    host: Arc<str>,
    sink: Option<Box<dyn Sink>>,
    readiness: ReadinessSignal,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            host: local_hostname(),
            sink: None,
            readiness: ReadinessSignal::new(),
        }
    }

    /// Deliver into `sink` instead of the configured output.
    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_host(mut self, host: impl Into<Arc<str>>) -> Self {
        self.host = host.into();
        self
    }

    pub fn readiness(&self) -> ReadinessSignal {
        self.readiness.clone()
    }

    /// Run until `agent_cancel` fires or a task fails, then shut down in
    /// order: intake, queue drain, final checkpoint. Setup failures are
    /// returned as errors; everything after startup is folded into the
    /// terminal state.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<ShutdownState, BoxError> {
        let config = self.config;
        info!(paths = ?config.paths, "Starting weblogicbeat");

        let coordinator = ShutdownCoordinator::new(config.shutdown.drain_timeout);

        let registry_path = config.registry_path();
        let db = JsonFileDatabase::open(&registry_path)?;
        let mut persister = db.persister(INPUT_SCOPE);
        let known_files = load_files(&mut persister)?;
        info!(
            registry = ?registry_path,
            files = known_files.len(),
            "Loaded registry"
        );

        // files from the last run stay in the registry until they are read
        // again or expire
        let mut tracker = FileOffsetTracker::new();
        for file in &known_files {
            tracker.restore(file.file_id, file.path.clone(), file.offset);
        }
        let tracker = tracker.shared();
        let resume_offsets = known_files
            .into_iter()
            .map(|f| (f.file_id, f.offset))
            .collect();
        let finder = FileFinder::new(config.paths.clone(), config.exclude.clone())?;
        let watcher = FileWatcher::new(finder, resume_offsets, config.start_at);
        let harvester_config = config.harvester_config(self.host.clone())?;

        let sink = match self.sink {
            Some(sink) => sink,
            None => build_sink(config.output.kind, config.output.path.as_ref())?,
        };

        let (publisher, event_rx) = EventPublisher::new(&config.queue, tracker.clone());
        let (ack_tx, ack_rx) = bounded_channel::bounded(ACK_CHANNEL_SIZE);

        let committer = FileOffsetCommitter::new(
            ack_rx,
            tracker.clone(),
            persister,
            config.committer_config(),
        );

        let (started_tx, started_rx) = oneshot::channel();
        let worker = DeliveryWorker::new(event_rx, sink, ack_tx, config.delivery_config())
            .with_started(started_tx);

        let (scan_tx, scan_rx) = oneshot::channel();
        let supervisor = Supervisor::new(
            watcher,
            harvester_config,
            publisher,
            tracker,
            config.scan_frequency(),
            config.watch_mode,
        )
        .with_first_scan(scan_tx);

        let mut intake_tasks = TaskSet::new();
        let mut pipeline_tasks = TaskSet::new();
        let mut committer_tasks = TaskSet::new();

        {
            let token = coordinator.committer_token();
            committer_tasks.spawn(async move {
                ("committer", committer.run(token).await.map_err(Into::into))
            });
        }
        {
            let token = coordinator.pipeline_token();
            pipeline_tasks
                .spawn(async move { ("delivery", worker.run(token).await.map_err(Into::into)) });
        }
        {
            let intake = coordinator.intake_token();
            let pipeline = coordinator.pipeline_token();
            intake_tasks
                .spawn(async move { ("supervisor", supervisor.run(intake, pipeline).await) });
        }

        let readiness = self.readiness.clone();
        let ready = async move {
            if started_rx.await.is_ok() {
                if let Ok(files) = scan_rx.await {
                    debug!(files, "First scan complete");
                    readiness.emit();
                }
            }
        };
        tokio::pin!(ready);
        let mut ready_done = false;

        let mut failed = false;
        loop {
            select! {
                biased;

                _ = agent_cancel.cancelled() => {
                    debug!("Agent cancellation signaled.");
                    break;
                },
                _ = &mut ready, if !ready_done => {
                    ready_done = true;
                },
                r = wait::wait_for_any_task(&mut pipeline_tasks) => {
                    early_exit(r);
                    failed = true;
                    break;
                },
                r = wait::wait_for_any_task(&mut committer_tasks) => {
                    early_exit(r);
                    failed = true;
                    break;
                },
                r = wait::wait_for_any_task(&mut intake_tasks) => {
                    early_exit(r);
                    failed = true;
                    break;
                },
            }
        }

        // Draining: intake stops, the worker empties the queue and exits once
        // the last publisher is gone.
        coordinator.begin_drain();
        if failed {
            coordinator.abort_drain();
        }
        let drain_deadline = Instant::now() + coordinator.drain_timeout();
        let mut timed_out = false;

        for (stage, tasks) in [("intake", &mut intake_tasks), ("delivery", &mut pipeline_tasks)] {
            match wait::wait_for_tasks_with_deadline(tasks, drain_deadline).await {
                Ok(()) => {}
                Err(WaitError::TimedOut) => {
                    warn!(stage, "Drain deadline passed");
                    timed_out = true;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Task failed while draining");
                    failed = true;
                }
            }
        }

        if timed_out {
            coordinator.abort_drain();
            for tasks in [&mut intake_tasks, &mut pipeline_tasks] {
                if let Err(e) = wait::wait_for_tasks_with_timeout(tasks, ABORT_GRACE).await {
                    warn!(error = %e, "Tasks did not stop after cancellation, aborting");
                    tasks.abort_all();
                }
            }
        }

        // Persisting: the committer applies remaining acks and writes its
        // final checkpoint.
        coordinator.begin_persist();
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut committer_tasks, PERSIST_TIMEOUT).await
        {
            error!(error = %e, "Final checkpoint failed");
            committer_tasks.abort_all();
            failed = true;
        }

        let state = if failed {
            ShutdownState::StoppedFailed
        } else if timed_out {
            ShutdownState::StoppedTimeout
        } else {
            ShutdownState::StoppedClean
        };
        Ok(coordinator.finish(state))
    }
}

fn early_exit(res: Option<(&'static str, Result<(), BoxError>)>) {
    match res {
        Some((task, Ok(()))) => warn!(task, "Unexpected early exit of task."),
        Some((task, Err(e))) => error!(task, error = %e, "Task failed"),
        None => warn!("Unexpected early exit of task."),
    }
}
