use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

use singleton::config::Config;
use singleton::probe::{Probe, ProbeError};

use crate::cli::{Args, Format};

mod cli;

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level())
        .parse_default_env()
        .init();
    miette::set_hook(args.format().into_error_hook())?;

    let mut config = Config::from_defaults();
    let loaded = match args.config() {
        Some(path) => Config::from_file(path)?,
        None => Config::from_dir(&std::env::current_dir()?)?,
    };
    if let Some(loaded) = loaded {
        config.update(&loaded);
    }
    config.probe.update(&args.to_probe_config());

    let report = match Probe::from_config(&config.probe).and_then(|probe| probe.run()) {
        Ok(report) => report,
        Err(err) => return report_failure(err),
    };

    let mut stdout = std::io::stdout().lock();
    match args.format() {
        Format::Long => write!(stdout, "{report}")?,
        Format::Json => {
            serde_json::to_writer_pretty(&mut stdout, &report)?;
            writeln!(stdout)?;
        }
    }

    match report.verify() {
        Ok(instance) => {
            if args.format() == Format::Long {
                writeln!(stdout, "ok: every observation resolved to {instance}")?;
            }

            Ok(ExitCode::SUCCESS)
        }
        Err(err) => report_failure(err),
    }
}

/// Renders the error with the miette handler picked by `--format`
fn report_failure(err: ProbeError) -> anyhow::Result<ExitCode> {
    let err: miette::Report = err.into();
    writeln!(std::io::stderr(), "{err:?}")?;

    Ok(ExitCode::FAILURE)
}
