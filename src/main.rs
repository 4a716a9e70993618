mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod provider;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use declarative::RunStatus;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub vars: Vec<String>,
    pub var_files: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let code = match run(cli) {
        Ok(status) => status.exit_code(),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            RunStatus::PartialFailure.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<RunStatus> {
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
        state: cli.state,
        vars: cli.vars,
        var_files: cli.var_files,
    };

    match cli.command {
        Command::Validate => commands::validate::run(&ctx),
        Command::Plan(args) => commands::plan::run(&ctx, &args),
        Command::Apply(args) => commands::apply::apply(&ctx, &args),
        Command::Destroy(args) => commands::apply::destroy(&ctx, &args),
        Command::State(cmd) => commands::state::run(&ctx, &cmd),
        Command::Graph => commands::graph::run(&ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "converge", &mut io::stdout());
            Ok(RunStatus::NoChanges)
        }
    }
}
