use std::path::{Path, PathBuf};

use singleton::config::ProbeConfig;
use singleton::probe::Strategy;

#[derive(Copy, Clone, PartialEq, Eq, clap::ValueEnum, Default)]
pub enum Format {
    #[default]
    Long,
    Json,
}

impl Format {
    pub fn into_error_hook(self) -> miette::ErrorHook {
        match self {
            Self::Long => Box::new(|_| Box::new(miette::GraphicalReportHandler::new())),
            Self::Json => Box::new(|_| Box::new(miette::JSONReportHandler::new())),
        }
    }
}

#[derive(clap::Parser)]
#[command(about, version)]
pub(crate) struct Args {
    /// Config file to use instead of looking for one in the current directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Render style for the report
    #[arg(long, value_enum, ignore_case = true, default_value("long"))]
    format: Format,

    /// Log more, can be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    probe: ProbeArgs,
}

#[derive(clap::Args)]
struct ProbeArgs {
    /// Number of threads racing for the instance
    #[arg(long)]
    threads: Option<usize>,

    /// Number of times each thread fetches the instance
    #[arg(long)]
    calls: Option<usize>,

    /// How the threads are run
    #[arg(long, value_enum, ignore_case = true)]
    strategy: Option<Strategy>,
}

impl Args {
    pub fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Settings given on the command line, applied on top of the config file
    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            threads: self.probe.threads,
            calls: self.probe.calls,
            strategy: self.probe.strategy,
        }
    }
}
