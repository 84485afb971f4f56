// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Logged once per run when the agent is operational. Supervisors wait for
/// this line.
pub const READY_MESSAGE: &str = "weblogicbeat is running! Hit CTRL-C to stop it.";

/// One-shot readiness marker. Once emitted it is never retracted.
#[derive(Clone)]
pub struct ReadinessSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the agent ready. Only the first call logs; returns whether this
    /// call did.
    pub fn emit(&self) -> bool {
        let emitted = self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
        if emitted {
            info!("{}", READY_MESSAGE);
        }
        emitted
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emits_once() {
        let signal = ReadinessSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_ready());

        let waiter = tokio::spawn(async move {
            rx.wait_for(|ready| *ready).await.unwrap();
        });

        assert!(signal.emit());
        assert!(!signal.clone().emit());
        assert!(signal.is_ready());
        waiter.await.unwrap();
    }
}
