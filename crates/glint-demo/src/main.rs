//! `glint`: apply screen-space bloom to an image file.

mod error;
mod run;
mod target;

use std::process::ExitCode;

use clap::Parser;
use glint_config::{CliArgs, Config};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config_dir();
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    glint_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    tracing::info!(
        input = %args.input.display(),
        backend = ?config.render.backend,
        frames = config.render.frames,
        "Starting glint"
    );

    match run::run(&config, &args.input, &args.output) {
        Ok(summary) => {
            tracing::info!(
                backend = summary.backend,
                frames = summary.frames,
                passes = summary.last_report.passes,
                "Done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("glint: {e}");
            ExitCode::FAILURE
        }
    }
}
