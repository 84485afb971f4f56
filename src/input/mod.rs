// SPDX-License-Identifier: Apache-2.0

//! Discovery and tailing of log files.

pub mod error;
pub mod file_id;
pub mod finder;
pub mod reader;

pub use error::{Error, Result};
pub use file_id::FileId;
pub use finder::FileFinder;
pub use reader::{RawRecord, ReadBatch, ReaderOptions, TailReader};
