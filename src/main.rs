use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use tilde_where::app::{self, Overrides, RunSettings};
use tilde_where::cli::{Cli, Commands};
use tilde_where::config::{self, WhereConfig};
use tilde_where::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("tilde-where error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let (config, config_path) = match &cli.config {
        Some(path) => (WhereConfig::load_from(path)?, path.clone()),
        None => (WhereConfig::load_or_init()?, config::config_path()),
    };
    let settings = RunSettings::resolve(
        &config,
        Overrides {
            api_key: cli.api_key,
            cache: cli.cache,
            home_root: cli.home_root,
            sessions_file: cli.sessions_file,
        },
    );

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config_path, &settings)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config_path, &settings),
        None => {
            let summary = app::run(&config, &settings)?;
            println!("{summary}");
            Ok(0)
        }
    }
}
