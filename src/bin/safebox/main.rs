//! SafeBox CLI - run programs under a monitored execution policy

mod cli;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use console::style;
use runner::{RunConfig, check_requirements, manager_config, quarantine, run_sandbox, show_report};

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", style("error:").red().bold(), e);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);
    let manager = manager_config(cli.storage, cli.workspace);

    match cli.command {
        Commands::Run {
            program,
            args,
            id,
            memory,
            cpu,
            timeout,
            max_processes,
            strict,
            interval_ms,
            json,
        } => {
            let config = RunConfig {
                id,
                program,
                args,
                memory,
                cpu,
                timeout,
                max_processes,
                strict,
                interval_ms,
                json,
            };
            match run_sandbox(manager, config) {
                Ok(code) => std::process::exit(code),
                Err(e) => fail(e),
            }
        }
        Commands::Show { report, json } => {
            if let Err(e) = show_report(&report, json) {
                fail(e);
            }
        }
        Commands::Quarantine { file, reason } => {
            if let Err(e) = quarantine(manager, &file, &reason) {
                fail(e);
            }
        }
        Commands::Check => check_requirements(&manager),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_trailing_args() {
        let cli = Cli::parse_from(["safebox", "run", "--timeout", "5", "--", "sh", "-c", "exit 2"]);
        match cli.command {
            Commands::Run {
                program,
                args,
                timeout,
                ..
            } => {
                assert_eq!(program, "sh");
                assert_eq!(args, vec!["-c", "exit 2"]);
                assert_eq!(timeout, Some(5));
            }
            _ => panic!("expected run"),
        }
    }
}
