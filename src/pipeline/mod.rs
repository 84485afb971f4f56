// SPDX-License-Identifier: Apache-2.0

//! Event queue and delivery.
//!
//! Harvesters publish events onto a bounded queue; a single delivery worker
//! batches them into the sink and reports delivered offsets to the committer.

pub mod queue;
pub mod retry;
pub mod worker;

pub use queue::{EventPublisher, OverflowPolicy, QueueConfig};
pub use retry::{Backoff, RetryConfig};
pub use worker::{DeliveryConfig, DeliveryWorker};

use thiserror::Error;

use crate::sinks::SinkError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("delivery to {sink} failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        sink: &'static str,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("event queue closed")]
    QueueClosed,

    #[error("cancelled while waiting on the event queue")]
    Cancelled,
}
