// SPDX-License-Identifier: Apache-2.0

pub mod committer;
pub mod persistence;
pub mod tracker;

pub use committer::{FileAck, FileOffsetCommitter, OffsetCommitterConfig};
pub use persistence::{JsonFileDatabase, RegistryError};
pub use tracker::{FileOffsetTracker, LineOffset, SharedOffsetTracker, lock_tracker};
