// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use weblogicbeat::init::agent::Agent;
use weblogicbeat::init::args::StartArgs;
use weblogicbeat::init::config::AgentConfig;
use weblogicbeat::shutdown::ShutdownState;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<StartArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "weblogicbeat")]
#[command(bin_name = "weblogicbeat")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "WEBLOGICBEAT_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version());
            ExitCode::SUCCESS
        }
        Some(Commands::Start(args)) => {
            // Config errors are reported before logging is up
            let mut config = match AgentConfig::load(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ERROR: {}", e);
                    return ExitCode::from(1);
                }
            };
            if let Some(data) = &args.path_data {
                config.path.data = data.clone();
            }

            let _guard = match setup_logging(&opt.log_format, args.log_file.as_deref()) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            match run_agent(config) {
                Ok(state) => ExitCode::from(state.exit_code()),
                Err(e) => {
                    error!(error = e, "Failed to run agent.");
                    ExitCode::from(1)
                }
            }
        }
        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            eprintln!("Must specify a command");
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn run_agent(config: AgentConfig) -> Result<ShutdownState, BoxError> {
    let cancel_token = CancellationToken::new();
    let agent = Agent::new(config);

    let run = agent.run(cancel_token.clone());
    tokio::pin!(run);

    select! {
        res = &mut run => return res,
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received.");
            cancel_token.cancel();
        },
    }

    // A second signal skips the rest of the shutdown sequence
    select! {
        res = &mut run => res,
        res = signal_wait() => {
            res?;
            warn!("Second shutdown signal received, exiting immediately.");
            Ok(ShutdownState::StoppedFailed)
        },
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg, log_file: Option<&Path>) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|e| format!("failed to open log file: {}: {}", path.display(), e))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("notify=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = log_file.is_none() && io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(unix)]
async fn signal_wait() -> Result<(), BoxError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn signal_wait() -> Result<(), BoxError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
