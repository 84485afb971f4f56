// SPDX-License-Identifier: Apache-2.0

pub mod assembler;
pub mod bounded_channel;
pub mod event;
pub mod harvester;
pub mod init;
pub mod input;
pub mod offsets;
pub mod pipeline;
pub mod readiness;
pub mod shutdown;
pub mod sinks;
pub mod supervisor;
pub mod watcher;
