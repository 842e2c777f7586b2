use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use antigravity_context_monitor::app;
use antigravity_context_monitor::cli::{Cli, Commands};
use antigravity_context_monitor::config::{self, MonitorConfig};
use antigravity_context_monitor::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("antigravity-context-monitor error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    let dashboard = cli.command.is_none() && io::stdout().is_terminal();
    if dashboard {
        setup_tracing(Some(&config::log_path()));
    } else {
        setup_tracing(None);
    }

    let config = MonitorConfig::load_or_init()?;
    let workspace = cli.workspace.as_deref();

    match cli.command {
        Some(Commands::Watch) => {
            app::run_watch(config, workspace)?;
            Ok(0)
        }
        Some(Commands::Status { json }) => {
            app::print_status(&config, workspace, json)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config, workspace),
        None => {
            app::run_dashboard(config, workspace)?;
            Ok(0)
        }
    }
}
