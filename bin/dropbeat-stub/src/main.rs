//! ---
//! dbt_section: "11-system-tests"
//! dbt_subsection: "02-stub-daemon"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Binary entrypoint for the stand-in dropbeat daemon."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
mod beater;
mod config;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use dbt_common::logging::{init_tracing, ConsoleTarget, LogFormat};
use dbt_common::LoggingConfig;
use tracing::{error, info};

use crate::beater::Dropbeat;
use crate::config::BeatSettings;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Parser)]
#[command(
    name = "dropbeat",
    version,
    about = "Stand-in dropbeat daemon",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        default_value = "dropbeat.yml",
        help = "Path to configuration file"
    )]
    config: PathBuf,

    #[arg(short = 'e', help = "Log to stderr instead of stdout")]
    stderr: bool,

    #[arg(long, value_enum, help = "Console log format")]
    log_format: Option<CliLogFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::StructuredJson,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        format: cli.log_format.map(Into::into).unwrap_or_default(),
        console: if cli.stderr {
            ConsoleTarget::Stderr
        } else {
            ConsoleTarget::Stdout
        },
        ..LoggingConfig::default()
    };
    let _guard = match init_tracing("dropbeat", &logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = BeatSettings::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        period = ?settings.period,
        urls = settings.urls.len(),
        paths = settings.paths.len(),
        "configuration loaded"
    );

    let shutdown = ShutdownSignal::install()?;
    Dropbeat::new(settings).run(shutdown.recv()).await?;
    Ok(())
}
