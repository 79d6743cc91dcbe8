//! Nestpack launcher
//!
//! Boots an application out of a nested archive container, or inspects the
//! container's contents.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nestpack")]
#[command(about = "Launch applications packaged as nested archive containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Container archive (defaults to this executable)
    #[arg(long, global = true)]
    container: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the container and run its entry module
    Run {
        /// Entry module (overrides the container descriptor)
        #[arg(long)]
        entry: Option<String>,
        /// Entry procedure
        #[arg(long)]
        procedure: Option<String>,
        /// Only report leftover threads at shutdown
        #[arg(long)]
        report_only: bool,
        /// Exit the process with the bootstrap status
        #[arg(long)]
        system_exit: bool,
        /// Arguments passed to the entry procedure
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List the locator of every entry in the container
    Ls {
        /// Only list code units
        #[arg(long)]
        units: bool,
    },

    /// Copy the bytes behind a locator to stdout
    Cat {
        /// `nest:` or `file:` locator
        locator: String,
    },

    /// Anything else is handed to the entry procedure, as with `run`
    #[command(external_subcommand)]
    Forward(Vec<String>),
}

impl Commands {
    fn run_with(args: Vec<String>) -> Self {
        Commands::Run {
            entry: None,
            procedure: None,
            report_only: false,
            system_exit: false,
            args,
        }
    }
}

impl Cli {
    /// The subcommand to execute. Bare and unrecognized invocations run the
    /// container with every argument forwarded.
    fn into_command(self) -> (Option<PathBuf>, Commands) {
        let command = match self.command {
            None => Commands::run_with(Vec::new()),
            Some(Commands::Forward(args)) => Commands::run_with(args),
            Some(command) => command,
        };
        (self.container, command)
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let (container, command) = cli.into_command();
    match command {
        Commands::Run {
            entry,
            procedure,
            report_only,
            system_exit,
            args,
        } => commands::run::execute(commands::run::RunArgs {
            container,
            entry,
            procedure,
            report_only,
            system_exit,
            args,
        }),
        Commands::Ls { units } => commands::ls::execute(container, units).map(|_| ExitCode::SUCCESS),
        Commands::Cat { locator } => {
            commands::cat::execute(container, &locator).map(|_| ExitCode::SUCCESS)
        }
        Commands::Forward(args) => commands::run::execute(commands::run::RunArgs {
            container,
            entry: None,
            procedure: None,
            report_only: false,
            system_exit: false,
            args,
        }),
    }
}

/// Log to stderr. `NESTPACK_LOG` takes precedence over `--verbose`.
fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("NESTPACK_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
