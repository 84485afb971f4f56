// SPDX-License-Identifier: Apache-2.0

//! Shutdown sequencing.
//!
//! Running -> Draining -> Persisting -> StoppedClean | StoppedTimeout, or
//! StoppedFailed after a fatal pipeline error. Each stage has its own
//! cancellation token so intake stops first while the queue keeps draining.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    /// Intake stopped, queued events are being delivered.
    Draining,
    /// Writing the final checkpoint.
    Persisting,
    StoppedClean,
    StoppedTimeout,
    StoppedFailed,
}

impl ShutdownState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShutdownState::StoppedClean | ShutdownState::StoppedTimeout | ShutdownState::StoppedFailed
        )
    }

    /// Process exit status for a terminal state.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownState::StoppedClean => 0,
            ShutdownState::StoppedTimeout => 2,
            _ => 1,
        }
    }
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    intake: CancellationToken,
    pipeline: CancellationToken,
    committer: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            intake: CancellationToken::new(),
            pipeline: CancellationToken::new(),
            committer: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Watcher and harvesters.
    pub fn intake_token(&self) -> CancellationToken {
        self.intake.clone()
    }

    /// Queue publishing at shutdown and the delivery worker.
    pub fn pipeline_token(&self) -> CancellationToken {
        self.pipeline.clone()
    }

    pub fn committer_token(&self) -> CancellationToken {
        self.committer.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Stop intake and let the queue drain.
    pub fn begin_drain(&self) {
        if self.advance(ShutdownState::Draining) {
            info!(
                drain_timeout = %humantime::format_duration(self.drain_timeout),
                "Stopping intake, draining queued events"
            );
        }
        self.intake.cancel();
    }

    /// Abandon queued events, after the drain deadline or a pipeline failure.
    pub fn abort_drain(&self) {
        warn!("Abandoning undelivered events");
        self.intake.cancel();
        self.pipeline.cancel();
    }

    pub fn begin_persist(&self) {
        self.advance(ShutdownState::Persisting);
        self.intake.cancel();
        self.pipeline.cancel();
        self.committer.cancel();
    }

    pub fn finish(&self, state: ShutdownState) -> ShutdownState {
        debug_assert!(state.is_terminal());
        self.advance(state);
        let state = self.state();
        info!(state = ?state, "Agent stopped");
        state
    }

    /// States only move forward.
    fn advance(&self, next: ShutdownState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || next <= *current {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Shutdown state change");
            *current = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_sequence() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        let intake = c.intake_token();
        let pipeline = c.pipeline_token();
        assert_eq!(c.state(), ShutdownState::Running);

        c.begin_drain();
        assert_eq!(c.state(), ShutdownState::Draining);
        assert!(intake.is_cancelled());
        assert!(!pipeline.is_cancelled());

        c.begin_persist();
        assert_eq!(c.state(), ShutdownState::Persisting);
        assert!(pipeline.is_cancelled());
        assert!(c.committer_token().is_cancelled());

        assert_eq!(c.finish(ShutdownState::StoppedClean).exit_code(), 0);
    }

    #[test]
    fn test_timeout_cancels_pipeline() {
        let c = ShutdownCoordinator::new(Duration::from_millis(1));
        c.begin_drain();
        c.abort_drain();
        assert!(c.pipeline_token().is_cancelled());
        assert_eq!(c.finish(ShutdownState::StoppedTimeout).exit_code(), 2);
    }

    #[test]
    fn test_states_never_go_back() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        c.begin_persist();
        c.begin_drain();
        assert_eq!(c.state(), ShutdownState::Persisting);

        c.finish(ShutdownState::StoppedFailed);
        c.finish(ShutdownState::StoppedClean);
        assert_eq!(c.state(), ShutdownState::StoppedFailed);
        assert_eq!(c.state().exit_code(), 1);
    }

    #[tokio::test]
    async fn test_state_observable() {
        let c = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut rx = c.subscribe();
        c.begin_drain();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ShutdownState::Draining);
    }
}
