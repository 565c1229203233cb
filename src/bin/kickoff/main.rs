//! CLI entry for the kickoff supervisor.

use clap::Parser;
use kickoff::config::AppConfig;
use kickoff::paths::WorkspacePaths;
use kickoff::preflight;
use kickoff::supervisor::Supervisor;
use kickoff::{init_logging, telemetry};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut config = AppConfig::parse();
    if let Err(err) = config.validate() {
        eprintln!("kickoff: {err}");
        return ExitCode::from(2);
    }

    init_logging(&config);
    telemetry::init_tracing(&config);

    let paths = WorkspacePaths::new(&config.workspace);

    if config.doctor {
        let results = preflight::run_preflight(&config, &paths);
        println!("{}", preflight::render_report(&config, &paths, &results));
        return ExitCode::SUCCESS;
    }

    if config.dry_run {
        let results = preflight::run_preflight(&config, &paths);
        println!("{}", preflight::render_report(&config, &paths, &results));
        return if preflight::first_failure(&results).is_some() {
            ExitCode::from(1)
        } else {
            ExitCode::SUCCESS
        };
    }

    match Supervisor::new(config).run() {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(err) => {
            eprintln!("kickoff: {err:#}");
            ExitCode::from(1)
        }
    }
}
