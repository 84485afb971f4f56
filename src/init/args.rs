// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Args, Clone, Default)]
pub struct StartArgs {
    /// Configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "WEBLOGICBEAT_CONFIG",
        default_value = "weblogicbeat.yml"
    )]
    pub config: PathBuf,

    /// Data directory, holds the registry. Overrides path.data.
    #[arg(long, env = "WEBLOGICBEAT_PATH_DATA")]
    pub path_data: Option<PathBuf>,

    /// Write the agent's own log to this file instead of stdout
    #[arg(long, env = "WEBLOGICBEAT_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}
